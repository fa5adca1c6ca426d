//! BlockDevice CRD
//!
//! A physical or raw block device discovered on a node by the node device
//! manager. The provisioner only reads these.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// BlockDevice describes a disk, partition or other raw device attached to a node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeAttributes.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Kernel device path, e.g. /dev/sdb
    #[serde(default)]
    pub path: String,

    /// Device capacity
    #[serde(default)]
    pub capacity: DeviceCapacity,

    /// Stable links to the device grouped by kind (by-id, by-path)
    #[serde(default)]
    pub devlinks: Vec<DeviceLink>,

    /// Filesystem present on the device
    #[serde(default)]
    pub filesystem: FileSystemInfo,

    /// Node the device is attached to
    #[serde(default)]
    pub node_attributes: NodeAttributes,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Device capacity in bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    #[serde(default)]
    pub storage: u64,
}

/// Group of links of one kind
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLink {
    /// Link kind, e.g. "by-id" or "by-path"
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub links: Vec<String>,
}

/// Filesystem information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

/// Node attributes shared by devices and claims
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_name: String,
}

/// Status of the BlockDevice
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    /// Claimed, Unclaimed or Released
    #[serde(default)]
    pub claim_state: String,

    /// Active, Inactive or Unknown
    #[serde(default)]
    pub state: String,
}

// =============================================================================
// Implementations
// =============================================================================

/// Where a bound device can be consumed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    /// Mountpoint of the filesystem on the device, if mounted
    pub mount_point: Option<String>,
    /// Raw device path, preferring a stable by-id link
    pub block_path: String,
}

impl DevicePaths {
    /// Mountpoint when reported, raw device path otherwise
    pub fn volume_path(&self) -> &str {
        self.mount_point.as_deref().unwrap_or(&self.block_path)
    }
}

impl BlockDevice {
    /// Resolve mountpoint and raw path of this device
    pub fn paths(&self) -> DevicePaths {
        let mount_point = self
            .spec
            .filesystem
            .mount_point
            .as_ref()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let first_link = |kind: Option<&str>| {
            self.spec
                .devlinks
                .iter()
                .filter(|l| kind.map_or(true, |k| l.kind == k))
                .find_map(|l| l.links.first())
                .cloned()
        };

        let block_path = first_link(Some("by-id"))
            .or_else(|| first_link(None))
            .unwrap_or_else(|| self.spec.path.clone());

        DevicePaths {
            mount_point,
            block_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(mount_point: Option<&str>, devlinks: Vec<DeviceLink>) -> BlockDevice {
        BlockDevice::new(
            "blockdevice-1",
            BlockDeviceSpec {
                path: "/dev/sdb".into(),
                devlinks,
                filesystem: FileSystemInfo {
                    fs_type: mount_point.map(|_| "ext4".to_string()),
                    mount_point: mount_point.map(str::to_string),
                },
                ..Default::default()
            },
        )
    }

    fn link(kind: &str, link: &str) -> DeviceLink {
        DeviceLink {
            kind: kind.into(),
            links: vec![link.into()],
        }
    }

    #[test]
    fn test_mount_point_preferred() {
        let bd = device(Some("/mnt/disk1"), vec![link("by-id", "/dev/disk/by-id/ata-1")]);
        let paths = bd.paths();
        assert_eq!(paths.volume_path(), "/mnt/disk1");
        assert_eq!(paths.block_path, "/dev/disk/by-id/ata-1");
    }

    #[test]
    fn test_by_id_preferred_over_other_links() {
        let bd = device(
            None,
            vec![
                link("by-path", "/dev/disk/by-path/pci-0000"),
                link("by-id", "/dev/disk/by-id/ata-1"),
            ],
        );
        assert_eq!(bd.paths().volume_path(), "/dev/disk/by-id/ata-1");
    }

    #[test]
    fn test_fallback_to_first_link_then_kernel_path() {
        let bd = device(None, vec![link("by-path", "/dev/disk/by-path/pci-0000")]);
        assert_eq!(bd.paths().volume_path(), "/dev/disk/by-path/pci-0000");

        let bd = device(Some("  "), vec![]);
        assert_eq!(bd.paths().volume_path(), "/dev/sdb");
    }
}
