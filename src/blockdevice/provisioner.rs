//! Block device provisioning
//!
//! Create binds a BlockDeviceClaim on the selected node and exposes the
//! device at its mountpoint (or raw path). Delete releases the claim recorded
//! on the PV; the device itself is wiped by the node device manager.

use super::claim::{ClaimReconciler, ClaimRequest};
use crate::config::ProvisionerConfig;
use crate::domain::ports::{ClusterClientRef, ProvisionContext, VolumeStrategy};
use crate::domain::volume::{
    LocalVolume, VolumeKind, VolumeRecord, VOLUME_MODE_BLOCK, VOLUME_MODE_FILESYSTEM,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Provisioner for volumes backed by a whole block device
pub struct BlockDeviceProvisioner {
    claims: ClaimReconciler,
}

impl BlockDeviceProvisioner {
    pub fn new(cluster: ClusterClientRef, config: Arc<ProvisionerConfig>) -> Self {
        Self {
            claims: ClaimReconciler::new(cluster, config),
        }
    }
}

#[async_trait]
impl VolumeStrategy for BlockDeviceProvisioner {
    async fn provision(
        &self,
        ctx: ProvisionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<LocalVolume> {
        let request = ctx.request;
        let config = ctx.config;
        let name = request.volume_name.as_str();

        let node_affinity = request.node_affinity_labels(config.node_affinity_label_keys())?;
        let hostname = request.node_hostname().to_string();
        if hostname.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "selected node for {} has no hostname label",
                name
            )));
        }

        info!(
            "Creating volume {} on node with labels {:?} using a block device",
            name, node_affinity
        );

        let claim_request = ClaimRequest {
            volume_name: name.to_string(),
            hostname,
            node_affinity: node_affinity.clone(),
            selectors: config.block_device_selectors().cloned(),
            capacity: request.requested_storage().cloned(),
            block_mode: request.is_block_mode(),
        };

        let (claim_name, device) = self.claims.bind(&claim_request, cancel).await?;
        let path = device.paths().volume_path().to_string();
        info!("Volume {} bound to {} through {}", name, path, claim_name);

        let volume_mode = if request.is_block_mode() {
            VOLUME_MODE_BLOCK
        } else {
            VOLUME_MODE_FILESYSTEM
        };

        Ok(LocalVolume {
            name: name.to_string(),
            kind: VolumeKind::Device {
                path,
                fs_type: config.fs_type().map(str::to_string),
                claim_name,
            },
            node_affinity,
            capacity: request.requested_storage().cloned(),
            access_modes: request.access_modes(),
            reclaim_policy: ctx.reclaim_policy.to_string(),
            volume_mode: volume_mode.to_string(),
            storage_class: Some(ctx.storage_class.to_string()),
        })
    }

    async fn delete(&self, record: &VolumeRecord, _cancel: &CancellationToken) -> Result<()> {
        let Some(claim) = record.claim_name.as_deref() else {
            info!("No BDC recorded on volume {}, nothing to release", record.name);
            return Ok(());
        };

        info!("Release the Block Device Claim {} for PV {}", claim, record.name);
        self.claims.release(claim).await
    }
}
