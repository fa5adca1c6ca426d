//! Resolved volume configuration
//!
//! Merges the engine defaults, the StorageClass layer and the PVC layer into
//! one read-only view with typed accessors.

use super::cas::{self, ConfigEntry};
use crate::error::{Error, Result};
use crate::hostpath::path::build_path;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// =============================================================================
// Well-known Keys
// =============================================================================

/// Hostpath or device backed volume
pub const KEY_STORAGE_TYPE: &str = "StorageType";
/// Base directory for hostpath volumes
pub const KEY_BASE_PATH: &str = "BasePath";
/// Filesystem type used with devices
pub const KEY_FS_TYPE: &str = "FSType";
/// Node label keys used for node affinity
pub const KEY_NODE_AFFINITY_LABELS: &str = "NodeAffinityLabels";
/// Label selectors used when claiming block devices
pub const KEY_BLOCK_DEVICE_SELECTORS: &str = "BlockDeviceSelectors";
/// Project quota on XFS backed base paths
pub const KEY_XFS_QUOTA: &str = "XFSQuota";
/// Project quota on ext4 backed base paths
pub const KEY_EXT4_QUOTA: &str = "EXT4Quota";
/// Directory permissions for hostpath volumes
pub const KEY_FILE_PERMISSIONS: &str = "FilePermissions";

/// Deprecated in favour of `BlockDeviceSelectors`
pub const KEY_DEPRECATED_BD_TAG: &str = "BlockDeviceTag";
/// Deprecated in favour of `NodeAffinityLabels`
pub const KEY_DEPRECATED_NODE_AFFINITY_LABEL: &str = "NodeAffinityLabel";

/// Quota data fields
pub const KEY_QUOTA_SOFT_LIMIT: &str = "softLimitGrace";
pub const KEY_QUOTA_HARD_LIMIT: &str = "hardLimitGrace";

/// FilePermissions data field
pub const KEY_FILE_MODE: &str = "mode";

/// Directory mode used when FilePermissions is absent
pub const DEFAULT_FS_MODE: &str = "0777";

// =============================================================================
// Storage Kind
// =============================================================================

/// How a volume is materialized on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    HostPath,
    Device,
}

impl StorageKind {
    /// Value of the `openebs.io/cas-type` label on provisioned PVs
    pub fn cas_type(&self) -> &'static str {
        match self {
            StorageKind::HostPath => "local-hostpath",
            StorageKind::Device => "local-device",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::HostPath => write!(f, "hostpath"),
            StorageKind::Device => write!(f, "device"),
        }
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hostpath" => Ok(StorageKind::HostPath),
            "device" => Ok(StorageKind::Device),
            other => Err(Error::UnsupportedStorageType(other.to_string())),
        }
    }
}

/// Quota grace settings as written in the config, before conversion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaGrace {
    pub soft: String,
    pub hard: String,
}

// =============================================================================
// Volume Config
// =============================================================================

/// Merged configuration for a single provisioning call
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    volume_name: String,
    entries: BTreeMap<String, ConfigEntry>,
}

impl VolumeConfig {
    /// Merge `defaults` < `class_layer` < `claim_layer`.
    ///
    /// Serialized layers are parsed first; a broken layer or a deprecated
    /// key fails the whole call.
    pub fn resolve(
        volume_name: &str,
        defaults: Vec<ConfigEntry>,
        class_layer: &str,
        claim_layer: &str,
    ) -> Result<Self> {
        debug!("Resolving config for {}: sc={:?} pvc={:?}", volume_name, class_layer, claim_layer);

        let class_entries = cas::parse_layer("storageclass", class_layer)?;
        let claim_entries = cas::parse_layer("pvc", claim_layer)?;

        let merged = cas::merge(cas::merge(defaults, class_entries), claim_entries);
        let config = Self::from_entries(volume_name, merged);
        config.reject_deprecated()?;

        Ok(config)
    }

    /// Build a config from already merged entries
    pub fn from_entries(volume_name: &str, entries: Vec<ConfigEntry>) -> Self {
        Self {
            volume_name: volume_name.to_string(),
            entries: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
        }
    }

    fn reject_deprecated(&self) -> Result<()> {
        if !self.value(KEY_DEPRECATED_BD_TAG).is_empty() {
            return Err(Error::DeprecatedOption {
                key: KEY_DEPRECATED_BD_TAG.to_string(),
                replacement: KEY_BLOCK_DEVICE_SELECTORS.to_string(),
            });
        }
        if !self.value(KEY_DEPRECATED_NODE_AFFINITY_LABEL).is_empty() {
            return Err(Error::DeprecatedOption {
                key: KEY_DEPRECATED_NODE_AFFINITY_LABEL.to_string(),
                replacement: KEY_NODE_AFFINITY_LABELS.to_string(),
            });
        }
        Ok(())
    }

    /// Name of the PV this config was resolved for
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    fn value(&self, key: &str) -> &str {
        self.entries
            .get(key)
            .and_then(|e| e.value.as_deref())
            .map(str::trim)
            .unwrap_or("")
    }

    fn enabled(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.enabled.as_deref())
            .map(|v| parse_bool(v.trim()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn data_field(&self, key: &str, field: &str) -> String {
        self.data(key)
            .and_then(|d| d.get(field))
            .cloned()
            .unwrap_or_default()
    }

    fn data(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(key).and_then(|e| e.data.as_ref())
    }

    /// StorageType value, `hostpath` when unset
    pub fn storage_type(&self) -> &str {
        match self.value(KEY_STORAGE_TYPE) {
            "" => "hostpath",
            v => v,
        }
    }

    /// Typed StorageType
    pub fn storage_kind(&self) -> Result<StorageKind> {
        self.storage_type().parse()
    }

    /// Configured base path, if any
    pub fn base_path(&self) -> Option<&str> {
        match self.value(KEY_BASE_PATH) {
            "" => None,
            v => Some(v),
        }
    }

    /// Validated host path of the volume: `<BasePath>/<pv name>`
    pub fn path(&self) -> Result<String> {
        let base = self.base_path().ok_or_else(|| {
            Error::Configuration("failed to get path: base path is empty".to_string())
        })?;
        build_path(base, &self.volume_name)
    }

    /// FSType, `None` means auto-detected
    pub fn fs_type(&self) -> Option<&str> {
        match self.value(KEY_FS_TYPE) {
            "" => None,
            v => Some(v),
        }
    }

    /// Custom node affinity label keys
    pub fn node_affinity_label_keys(&self) -> Option<&[String]> {
        self.entries
            .get(KEY_NODE_AFFINITY_LABELS)
            .and_then(|e| e.list.as_deref())
            .filter(|l| !l.is_empty())
    }

    /// Block device selectors
    pub fn block_device_selectors(&self) -> Option<&BTreeMap<String, String>> {
        self.data(KEY_BLOCK_DEVICE_SELECTORS)
    }

    pub fn is_xfs_quota_enabled(&self) -> bool {
        self.enabled(KEY_XFS_QUOTA)
    }

    pub fn is_ext4_quota_enabled(&self) -> bool {
        self.enabled(KEY_EXT4_QUOTA)
    }

    /// Quota grace settings of the enabled quota entry.
    ///
    /// XFSQuota wins when both entries are enabled.
    pub fn quota_grace(&self) -> Option<QuotaGrace> {
        let key = if self.is_xfs_quota_enabled() {
            KEY_XFS_QUOTA
        } else if self.is_ext4_quota_enabled() {
            KEY_EXT4_QUOTA
        } else {
            return None;
        };

        Some(QuotaGrace {
            soft: self.data_field(key, KEY_QUOTA_SOFT_LIMIT).trim().to_string(),
            hard: self.data_field(key, KEY_QUOTA_HARD_LIMIT).trim().to_string(),
        })
    }

    /// Directory mode for hostpath volumes, validated as octal
    pub fn fs_mode(&self) -> Result<String> {
        let mode = self.data_field(KEY_FILE_PERMISSIONS, KEY_FILE_MODE);
        let mode = mode.trim();
        if mode.is_empty() {
            return Ok(DEFAULT_FS_MODE.to_string());
        }

        let valid = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
        if !valid {
            return Err(Error::Configuration(format!(
                "invalid {} mode {:?}: expected 3 or 4 octal digits",
                KEY_FILE_PERMISSIONS, mode
            )));
        }
        Ok(mode.to_string())
    }
}

/// Accepted boolean spellings for `enabled`
fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
