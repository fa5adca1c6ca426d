//! Provisioner
//!
//! Entry point called by the controller. Validates the request, resolves the
//! layered config and hands the call to the hostpath or device strategy.
//! Deletion re-derives the volume from its PersistentVolume and dispatches
//! on the recorded kind.

use crate::blockdevice::BlockDeviceProvisioner;
use crate::config::{ProvisionerConfig, StorageKind, VolumeConfig, CAS_CONFIG_ANNOTATION};
use crate::domain::ports::{ClusterClientRef, ProvisionContext, VolumeStrategyRef};
use crate::domain::volume::{
    LocalVolume, ProvisionRequest, VolumeRecord, ACCESS_MODE_RWO, RECLAIM_DELETE,
};
use crate::error::{Error, Result};
use crate::hostpath::HostPathProvisioner;
use crate::metrics::{ProvisionerMetrics, UNKNOWN_STORAGE_TYPE};
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const SNAPSHOT_KIND: &str = "VolumeSnapshot";
const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";
const PVC_KIND: &str = "PersistentVolumeClaim";

/// Provisions and deletes node-local volumes
pub struct Provisioner {
    cluster: ClusterClientRef,
    config: Arc<ProvisionerConfig>,
    hostpath: VolumeStrategyRef,
    device: VolumeStrategyRef,
    metrics: Option<ProvisionerMetrics>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Create a provisioner, failing on invalid process configuration
    pub fn new(cluster: ClusterClientRef, config: ProvisionerConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Self {
            hostpath: Arc::new(HostPathProvisioner::new(cluster.clone(), config.clone())),
            device: Arc::new(BlockDeviceProvisioner::new(cluster.clone(), config.clone())),
            cluster,
            config,
            metrics: None,
        })
    }

    /// Record operation counters into `metrics`
    pub fn with_metrics(mut self, metrics: ProvisionerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    fn strategy(&self, kind: StorageKind) -> &VolumeStrategyRef {
        match kind {
            StorageKind::HostPath => &self.hostpath,
            StorageKind::Device => &self.device,
        }
    }

    /// Provision a volume for `request`.
    ///
    /// On failure no volume is returned; [`Error::provisioning_state`] tells
    /// the caller whether to reschedule.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<LocalVolume> {
        let mut kind = None;
        let result = self.do_provision(request, cancel, &mut kind).await;

        if let Err(e) = &result {
            let storage_type = kind.map_or_else(|| UNKNOWN_STORAGE_TYPE.to_string(), |k| k.to_string());
            error!(
                "Failed to provision Local PV {} (storage type {}): {}",
                request.volume_name, storage_type, e
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_provision(kind, result.is_ok());
        }
        result
    }

    async fn do_provision(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
        resolved_kind: &mut Option<StorageKind>,
    ) -> Result<LocalVolume> {
        validate_request(request)?;
        let name = request.volume_name.as_str();

        let class = self.storage_class(request).await?;
        let class_name = class.metadata.name.clone().unwrap_or_default();
        let reclaim_policy = class
            .reclaim_policy
            .clone()
            .unwrap_or_else(|| RECLAIM_DELETE.to_string());

        let config = VolumeConfig::resolve(
            name,
            self.config.default_layer(),
            cas_annotation(class.metadata.annotations.as_ref()),
            cas_annotation(request.claim.metadata.annotations.as_ref()),
        )?;

        let kind = match config.storage_type() {
            "device" => StorageKind::Device,
            other if request.is_block_mode() => {
                return Err(Error::InvalidRequest(format!(
                    "PV with BlockMode is not supported with StorageType {}",
                    other
                )))
            }
            _ => config.storage_kind()?,
        };
        *resolved_kind = Some(kind);

        info!(
            "Provisioning {} volume {} for claim {} on node {}",
            kind,
            name,
            request.claim_name(),
            request.node_hostname()
        );

        let ctx = ProvisionContext {
            request,
            config: &config,
            storage_class: &class_name,
            reclaim_policy: &reclaim_policy,
        };
        let volume = self.strategy(kind).provision(ctx, cancel).await?;

        info!("Successfully provisioned Local PV {} at {}", name, volume.kind.path());
        Ok(volume)
    }

    async fn storage_class(&self, request: &ProvisionRequest) -> Result<StorageClass> {
        let name = request.storage_class_name().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "storage class name missing on claim {}",
                request.claim_name()
            ))
        })?;
        self.cluster.get_storage_class(name).await
    }

    /// Release the storage behind `pv`; a retained volume is left untouched
    pub async fn delete(&self, pv: &PersistentVolume, cancel: &CancellationToken) -> Result<()> {
        let record = VolumeRecord::from_persistent_volume(pv)?;

        if record.is_retained() {
            info!("Retained volume {}", record.name);
            return Ok(());
        }

        let storage_type = record.kind.to_string();
        let result = self.strategy(record.kind).delete(&record, cancel).await;

        match &result {
            Ok(()) => info!("Successfully deleted Local PV {}", record.name),
            Err(e) => error!(
                "Failed to delete volume {} (storage type {}): {}",
                record.name, storage_type, e
            ),
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_delete(record.kind, result.is_ok());
        }
        result
    }
}

fn cas_annotation(annotations: Option<&std::collections::BTreeMap<String, String>>) -> &str {
    annotations
        .and_then(|a| a.get(CAS_CONFIG_ANNOTATION))
        .map(String::as_str)
        .unwrap_or("")
}

/// Checks done before any configuration is read
fn validate_request(request: &ProvisionRequest) -> Result<()> {
    let spec = request.claim.spec.as_ref().ok_or_else(|| {
        Error::InvalidRequest(format!("claim {} has no spec", request.claim_name()))
    })?;

    if let Some(source) = &spec.data_source {
        if source.name.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "dataSource name not found for PVC `{}`",
                request.claim_name()
            )));
        }
        let group = source.api_group.as_deref().unwrap_or("");
        let reason = match source.kind.as_str() {
            SNAPSHOT_KIND if group == SNAPSHOT_API_GROUP => {
                "snapshot feature not supported by this provisioner".to_string()
            }
            PVC_KIND => "clone feature not supported by this provisioner".to_string(),
            kind => format!(
                "datasource `{}` of group `{}` is not handled by the provisioner",
                kind, group
            ),
        };
        return Err(Error::InvalidRequest(reason));
    }

    if spec.selector.is_some() {
        return Err(Error::InvalidRequest(
            "claim.Spec.Selector is not supported".to_string(),
        ));
    }

    if request.access_modes().iter().any(|m| m != ACCESS_MODE_RWO) {
        return Err(Error::InvalidRequest(
            "Only support ReadWriteOnce access mode".to_string(),
        ));
    }

    let node = request.selected_node.as_ref().ok_or(Error::NoSelectedNode)?;
    if request.node_hostname().is_empty() {
        return Err(Error::InvalidRequest(format!(
            "configuration error, node {} hostname is empty",
            node.metadata.name.as_deref().unwrap_or_default()
        )));
    }

    Ok(())
}
