//! BlockDeviceClaim CRD
//!
//! An intent to bind a Local PV to one BlockDevice. The node device manager
//! fills in `spec.blockDeviceName` once a matching device is found.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::block_device::NodeAttributes;

/// Finalizer placed on every claim created by the provisioner
pub const LOCAL_PV_FINALIZER: &str = "local.openebs.io/finalizer";

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// BlockDeviceClaim requests a BlockDevice matching node and label selectors.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name": "BlockDeviceName", "type": "string", "jsonPath": ".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Requested resources
    #[serde(default)]
    pub resources: ClaimResources,

    /// Name of the bound device; empty until bound
    #[serde(default)]
    pub block_device_name: String,

    /// Node the device must be attached to
    #[serde(default)]
    pub block_device_node_attributes: NodeAttributes,

    /// How the device will be consumed
    #[serde(default)]
    pub device_claim_details: DeviceClaimDetails,

    /// Label selector on BlockDevices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ClaimSelector>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Requested resources, keyed by resource name ("storage")
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

/// Volume mode the device is claimed for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BlockVolumeMode {
    #[default]
    FileSystem,
    Block,
}

/// Claim details
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaimDetails {
    #[serde(default)]
    pub block_volume_mode: BlockVolumeMode,
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Claim phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
}

/// Status of the BlockDeviceClaim
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDeviceClaim {
    /// Bound device name, `None` while unbound
    pub fn bound_device(&self) -> Option<&str> {
        match self.spec.block_device_name.trim() {
            "" => None,
            name => Some(name),
        }
    }

    /// Check for a finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == finalizer))
            .unwrap_or(false)
    }

    /// Drop a finalizer, returning whether it was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(finalizers) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != finalizer);
                before != finalizers.len()
            }
            None => false,
        }
    }
}
