//! Volume model
//!
//! [`ProvisionRequest`] is what the outer controller hands to the engine,
//! [`LocalVolume`] is what the engine hands back, and [`VolumeRecord`] is the
//! recovery record read back from a PersistentVolume at delete time.

use crate::config::StorageKind;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

// =============================================================================
// Well-known Labels and Annotations
// =============================================================================

/// Label carrying the local PV flavour
pub const CAS_TYPE_LABEL: &str = "openebs.io/cas-type";

/// Annotation recording the BlockDeviceClaim backing a device volume
pub const BDC_ANNOTATION: &str = "local.openebs.io/blockdeviceclaim";

/// Node label used for affinity when no custom labels are configured
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Legacy PVC annotation naming the storage class
pub const BETA_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

pub const ACCESS_MODE_RWO: &str = "ReadWriteOnce";

pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";
pub const VOLUME_MODE_BLOCK: &str = "Block";

pub const RECLAIM_DELETE: &str = "Delete";
pub const RECLAIM_RETAIN: &str = "Retain";

// =============================================================================
// Provision Request
// =============================================================================

/// Request to provision a volume for a claim
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Name of the PV to create, generated upstream
    pub volume_name: String,
    /// The claim being served
    pub claim: PersistentVolumeClaim,
    /// Node chosen by the scheduler, if any
    pub selected_node: Option<Node>,
}

impl ProvisionRequest {
    pub fn new(
        volume_name: impl Into<String>,
        claim: PersistentVolumeClaim,
        selected_node: Option<Node>,
    ) -> Self {
        Self {
            volume_name: volume_name.into(),
            claim,
            selected_node,
        }
    }

    /// Name of the claim, empty when unset
    pub fn claim_name(&self) -> &str {
        self.claim.metadata.name.as_deref().unwrap_or("")
    }

    /// Storage class, from the beta annotation first, then the spec
    pub fn storage_class_name(&self) -> Option<&str> {
        self.claim
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BETA_STORAGE_CLASS_ANNOTATION))
            .map(String::as_str)
            .or_else(|| {
                self.claim
                    .spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
            })
            .filter(|s| !s.is_empty())
    }

    /// Requested storage quantity
    pub fn requested_storage(&self) -> Option<&Quantity> {
        self.claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
    }

    pub fn access_modes(&self) -> Vec<String> {
        self.claim
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default()
    }

    /// Requested volume mode, `Filesystem` when unset
    pub fn volume_mode(&self) -> &str {
        self.claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_mode.as_deref())
            .unwrap_or(VOLUME_MODE_FILESYSTEM)
    }

    pub fn is_block_mode(&self) -> bool {
        self.volume_mode() == VOLUME_MODE_BLOCK
    }

    /// Value of the hostname label on the selected node
    pub fn node_hostname(&self) -> &str {
        self.selected_node
            .as_ref()
            .map(|n| node_label(n, HOSTNAME_LABEL))
            .unwrap_or("")
    }

    /// Affinity labels pinning the volume to the selected node.
    ///
    /// Uses the hostname label unless custom keys are configured, in which
    /// case each key is looked up on the node.
    pub fn node_affinity_labels(&self, keys: Option<&[String]>) -> Result<BTreeMap<String, String>> {
        let node = self.selected_node.as_ref().ok_or(Error::NoSelectedNode)?;
        let labels = match keys {
            None => BTreeMap::from([(
                HOSTNAME_LABEL.to_string(),
                node_label(node, HOSTNAME_LABEL).to_string(),
            )]),
            Some(keys) => keys
                .iter()
                .map(|k| (k.clone(), node_label(node, k).to_string()))
                .collect(),
        };
        Ok(labels)
    }
}

/// Label value on a node, empty when absent
pub fn node_label<'a>(node: &'a Node, key: &str) -> &'a str {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .unwrap_or("")
}

// =============================================================================
// Local Volume
// =============================================================================

/// How the volume is backed on the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    /// Directory created under a base path
    HostPath { path: String },
    /// Bound block device, consumed at its mountpoint or raw path
    Device {
        path: String,
        fs_type: Option<String>,
        claim_name: String,
    },
}

impl VolumeKind {
    pub fn storage_kind(&self) -> StorageKind {
        match self {
            VolumeKind::HostPath { .. } => StorageKind::HostPath,
            VolumeKind::Device { .. } => StorageKind::Device,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            VolumeKind::HostPath { path } | VolumeKind::Device { path, .. } => path,
        }
    }
}

/// A provisioned node-local volume
#[derive(Debug, Clone)]
pub struct LocalVolume {
    pub name: String,
    pub kind: VolumeKind,
    /// Node labels the volume is pinned to
    pub node_affinity: BTreeMap<String, String>,
    pub capacity: Option<Quantity>,
    pub access_modes: Vec<String>,
    pub reclaim_policy: String,
    pub volume_mode: String,
    pub storage_class: Option<String>,
}

impl LocalVolume {
    /// Build the PersistentVolume object for this volume
    pub fn to_persistent_volume(&self) -> PersistentVolume {
        let labels = BTreeMap::from([(
            CAS_TYPE_LABEL.to_string(),
            self.kind.storage_kind().cas_type().to_string(),
        )]);

        let (local, annotations) = match &self.kind {
            VolumeKind::HostPath { path } => (
                LocalVolumeSource {
                    path: path.clone(),
                    fs_type: None,
                },
                None,
            ),
            VolumeKind::Device {
                path,
                fs_type,
                claim_name,
            } => (
                LocalVolumeSource {
                    path: path.clone(),
                    fs_type: fs_type.clone(),
                },
                Some(BTreeMap::from([(BDC_ANNOTATION.to_string(), claim_name.clone())])),
            ),
        };

        let match_expressions = self
            .node_affinity
            .iter()
            .map(|(key, value)| NodeSelectorRequirement {
                key: key.clone(),
                operator: "In".to_string(),
                values: Some(vec![value.clone()]),
            })
            .collect();

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(labels),
                annotations,
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(self.access_modes.clone()),
                capacity: self
                    .capacity
                    .clone()
                    .map(|q| BTreeMap::from([("storage".to_string(), q)])),
                local: Some(local),
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(match_expressions),
                            match_fields: None,
                        }],
                    }),
                }),
                persistent_volume_reclaim_policy: Some(self.reclaim_policy.clone()),
                storage_class_name: self.storage_class.clone(),
                volume_mode: Some(self.volume_mode.clone()),
                ..Default::default()
            }),
            status: None,
        }
    }
}

// =============================================================================
// Recovery Record
// =============================================================================

/// State re-derived from an existing PersistentVolume at delete time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    pub kind: StorageKind,
    /// Local path, `None` when the PV carries no local source
    pub path: Option<String>,
    pub node_affinity: BTreeMap<String, String>,
    /// BlockDeviceClaim recorded on device volumes
    pub claim_name: Option<String>,
    pub reclaim_policy: String,
}

impl VolumeRecord {
    pub fn from_persistent_volume(pv: &PersistentVolume) -> Result<Self> {
        let name = pv
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidRequest("persistent volume has no name".to_string()))?;

        let kind = match pv.metadata.labels.as_ref().and_then(|l| l.get(CAS_TYPE_LABEL)) {
            Some(t) if t == StorageKind::Device.cas_type() => StorageKind::Device,
            _ => StorageKind::HostPath,
        };

        let spec = pv.spec.as_ref();

        let path = spec
            .and_then(|s| {
                s.local
                    .as_ref()
                    .map(|l| l.path.clone())
                    .or_else(|| s.host_path.as_ref().map(|h| h.path.clone()))
            })
            .filter(|p| !p.is_empty());

        let node_affinity = spec
            .and_then(|s| s.node_affinity.as_ref())
            .and_then(|a| a.required.as_ref())
            .map(|required| {
                required
                    .node_selector_terms
                    .iter()
                    .flat_map(|t| t.match_expressions.iter().flatten())
                    .filter(|e| e.operator == "In")
                    .filter_map(|e| {
                        let value = e.values.as_ref()?.first()?;
                        Some((e.key.clone(), value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let claim_name = pv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BDC_ANNOTATION))
            .filter(|c| !c.is_empty())
            .cloned();

        let reclaim_policy = spec
            .and_then(|s| s.persistent_volume_reclaim_policy.clone())
            .unwrap_or_else(|| RECLAIM_DELETE.to_string());

        Ok(Self {
            name,
            kind,
            path,
            node_affinity,
            claim_name,
            reclaim_policy,
        })
    }

    pub fn is_retained(&self) -> bool {
        self.reclaim_policy == RECLAIM_RETAIN
    }
}
