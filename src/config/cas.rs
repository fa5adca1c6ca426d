//! CAS config layers
//!
//! A layer is the YAML list stored in the `cas.openebs.io/config`
//! annotation of a StorageClass or PersistentVolumeClaim:
//!
//! ```yaml
//! - name: StorageType
//!   value: "hostpath"
//! - name: XFSQuota
//!   enabled: true
//!   data:
//!     softLimitGrace: "20%"
//!     hardLimitGrace: "50%"
//! - name: NodeAffinityLabels
//!   list:
//!     - "openebs.io/rack"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation carrying a config layer on StorageClasses and PVCs
pub const CAS_CONFIG_ANNOTATION: &str = "cas.openebs.io/config";

// =============================================================================
// Config Entry
// =============================================================================

/// A single named entry of a config layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    /// Entry name, e.g. `BasePath`
    pub name: String,

    /// Scalar value
    #[serde(default, deserialize_with = "scalar::option", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Enabled flag, kept verbatim and interpreted by the accessors
    #[serde(default, deserialize_with = "scalar::option", skip_serializing_if = "Option::is_none")]
    pub enabled: Option<String>,

    /// Key/value data
    #[serde(default, deserialize_with = "scalar::map", skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,

    /// List of strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
}

impl ConfigEntry {
    /// Entry with only a scalar value
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Layer Parsing & Merging
// =============================================================================

/// Parse one serialized layer. Blank input is an empty layer.
///
/// A malformed layer fails the whole resolution; nothing from it is merged.
pub fn parse_layer(layer: &str, raw: &str) -> Result<Vec<ConfigEntry>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<ConfigEntry> =
        serde_yaml::from_str(raw).map_err(|e| Error::InvalidConfigLayer {
            layer: layer.to_string(),
            reason: e.to_string(),
        })?;

    for entry in entries.iter_mut() {
        entry.name = entry.name.trim().to_string();
        if entry.name.is_empty() {
            return Err(Error::InvalidConfigLayer {
                layer: layer.to_string(),
                reason: "config entry without a name".to_string(),
            });
        }
    }

    Ok(entries)
}

/// Overlay `upper` on `lower`: same-named entries are replaced whole,
/// entries only present in `lower` are kept.
pub fn merge(lower: Vec<ConfigEntry>, upper: Vec<ConfigEntry>) -> Vec<ConfigEntry> {
    let mut merged = lower;
    for entry in upper {
        match merged.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => merged.push(entry),
        }
    }
    merged
}

/// YAML scalars arrive as bools, numbers or strings; entries keep strings.
mod scalar {
    use serde::{Deserialize, Deserializer};
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    impl From<Scalar> for String {
        fn from(s: Scalar) -> Self {
            match s {
                Scalar::Bool(b) => b.to_string(),
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(f) => f.to_string(),
                Scalar::Str(s) => s,
            }
        }
    }

    pub fn option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(String::from))
    }

    pub fn map<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<BTreeMap<String, Scalar>>::deserialize(deserializer)?
            .map(|m| m.into_iter().map(|(k, v)| (k, String::from(v))).collect()))
    }
}
