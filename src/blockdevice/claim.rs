//! Block Device Claim Reconciler
//!
//! One BlockDeviceClaim per volume, named `bdc-<pv>`. A claim left behind by
//! an interrupted call is adopted. Binding is polled a bounded number of
//! times; a claim that never binds is released again before the call fails.

use crate::config::ProvisionerConfig;
use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockVolumeMode, ClaimResources,
    ClaimSelector, DeviceClaimDetails, NodeAttributes, LOCAL_PV_FINALIZER,
};
use crate::domain::ports::ClusterClientRef;
use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Claim name for a volume
pub fn claim_name(volume_name: &str) -> String {
    format!("bdc-{}", volume_name)
}

/// What the claim asks for
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub volume_name: String,
    /// Hostname of the node the device must be attached to
    pub hostname: String,
    pub node_affinity: BTreeMap<String, String>,
    /// Extra device label selectors
    pub selectors: Option<BTreeMap<String, String>>,
    pub capacity: Option<Quantity>,
    pub block_mode: bool,
}

impl ClaimRequest {
    fn validate(&self) -> Result<()> {
        if self.volume_name.is_empty() || self.hostname.is_empty() {
            return Err(Error::InvalidRequest(
                "invalid empty name or node hostname".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the claim object
    pub fn to_claim(&self, namespace: &str) -> BlockDeviceClaim {
        let mut match_labels = self.node_affinity.clone();
        if let Some(selectors) = &self.selectors {
            match_labels.extend(selectors.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let requests = self
            .capacity
            .iter()
            .map(|q| ("storage".to_string(), q.0.clone()))
            .collect();

        let mut claim = BlockDeviceClaim::new(
            &claim_name(&self.volume_name),
            BlockDeviceClaimSpec {
                resources: ClaimResources { requests },
                block_device_name: String::new(),
                block_device_node_attributes: NodeAttributes {
                    host_name: self.hostname.clone(),
                    ..Default::default()
                },
                device_claim_details: DeviceClaimDetails {
                    block_volume_mode: if self.block_mode {
                        BlockVolumeMode::Block
                    } else {
                        BlockVolumeMode::FileSystem
                    },
                },
                selector: Some(ClaimSelector { match_labels }),
            },
        );
        claim.metadata = ObjectMeta {
            name: Some(claim_name(&self.volume_name)),
            namespace: Some(namespace.to_string()),
            finalizers: Some(vec![LOCAL_PV_FINALIZER.to_string()]),
            ..Default::default()
        };
        claim
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Creates, polls and releases block device claims
pub struct ClaimReconciler {
    cluster: ClusterClientRef,
    config: Arc<ProvisionerConfig>,
}

impl ClaimReconciler {
    pub fn new(cluster: ClusterClientRef, config: Arc<ProvisionerConfig>) -> Self {
        Self { cluster, config }
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Create the claim for `request`, or adopt an existing one.
    ///
    /// Returns the claim name.
    pub async fn ensure(&self, request: &ClaimRequest) -> Result<String> {
        request.validate()?;
        let name = claim_name(&request.volume_name);

        match self.cluster.get_claim(self.namespace(), &name).await {
            Ok(_) => {
                info!("Volume {} has been initialized with BDC: {}", request.volume_name, name);
                return Ok(name);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let claim = request.to_claim(self.namespace());
        match self.cluster.create_claim(self.namespace(), &claim).await {
            Ok(_) => info!("Created BDC {} for volume {}", name, request.volume_name),
            Err(Error::ResourceExists { .. }) => {
                info!("BDC {} created concurrently, adopting it", name);
            }
            Err(e) => {
                return Err(Error::BlockDeviceClaim {
                    claim: name,
                    reason: format!("failed to create: {}", e),
                })
            }
        }
        Ok(name)
    }

    /// Poll `claim` until a device is bound.
    ///
    /// After `claim_retry_count` reads without binding the claim is released
    /// and [`Error::NoBlockDeviceFound`] returned. A failed release is logged
    /// only.
    pub async fn wait_for_device(
        &self,
        claim: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!("Getting Block Device Path from BDC {}", claim);

        for attempt in 0..self.config.claim_retry_count {
            let current = self
                .cluster
                .get_claim(self.namespace(), claim)
                .await
                .map_err(|e| Error::BlockDeviceClaim {
                    claim: claim.to_string(),
                    reason: format!("unable to get BDC associated with PV {}: {}", volume_name, e),
                })?;

            if let Some(device) = current.bound_device() {
                debug!("BDC {} bound to {} after {} polls", claim, device, attempt + 1);
                return Ok(device.to_string());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting on BDC {}", claim)));
                }
                _ = tokio::time::sleep(self.config.claim_poll_interval) => {}
            }
        }

        warn!(
            "Unable to find BD for BDC {} associated with PV {}, deleting BDC",
            claim, volume_name
        );
        if let Err(e) = self.release(claim).await {
            warn!("Unable to delete BDC {}: {}", claim, e);
        }

        Err(Error::NoBlockDeviceFound {
            claim: claim.to_string(),
            volume: volume_name.to_string(),
        })
    }

    /// Ensure, wait and fetch the bound device
    pub async fn bind(
        &self,
        request: &ClaimRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, BlockDevice)> {
        let claim = self.ensure(request).await?;
        let device_name = self
            .wait_for_device(&claim, &request.volume_name, cancel)
            .await?;

        let device = self
            .cluster
            .get_block_device(self.namespace(), &device_name)
            .await
            .map_err(|e| Error::BlockDeviceClaim {
                claim: claim.clone(),
                reason: format!("unable to find BD {}: {}", device_name, e),
            })?;

        Ok((claim, device))
    }

    /// Remove the finalizer from `claim` and delete it.
    ///
    /// A claim that no longer exists counts as released. The claim is not
    /// deleted when the finalizer cannot be removed.
    pub async fn release(&self, claim: &str) -> Result<()> {
        let mut current = match self.cluster.get_claim(self.namespace(), claim).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                debug!("BDC {} already removed", claim);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if current.remove_finalizer(LOCAL_PV_FINALIZER) {
            debug!("Removing local-pv finalizer on BDC {}", claim);
            self.cluster
                .replace_claim(self.namespace(), &current)
                .await
                .map_err(|e| Error::BlockDeviceClaim {
                    claim: claim.to_string(),
                    reason: format!("unable to remove finalizer: {}", e),
                })?;
        }

        match self.cluster.delete_claim(self.namespace(), claim).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::BlockDeviceClaim {
                claim: claim.to_string(),
                reason: format!("unable to delete: {}", e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::BlockDeviceSpec;
    use crate::domain::ports::ClusterClient;
    use crate::testutil::{self, NAMESPACE};
    use assert_matches::assert_matches;

    fn request() -> ClaimRequest {
        ClaimRequest {
            volume_name: "pvc-1".into(),
            hostname: "worker-1".into(),
            node_affinity: BTreeMap::from([(
                "kubernetes.io/hostname".to_string(),
                "worker-1".to_string(),
            )]),
            selectors: Some(BTreeMap::from([(
                "openebs.io/block-device-tag".to_string(),
                "mongo".to_string(),
            )])),
            capacity: Some(Quantity("5G".into())),
            block_mode: false,
        }
    }

    fn setup() -> (Arc<InMemoryCluster>, ClaimReconciler) {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = ClaimReconciler::new(cluster.clone(), testutil::config());
        (cluster, reconciler)
    }

    #[test]
    fn test_claim_object() {
        let claim = request().to_claim(NAMESPACE);
        assert_eq!(claim.metadata.name.as_deref(), Some("bdc-pvc-1"));
        assert!(claim.has_finalizer(LOCAL_PV_FINALIZER));
        assert_eq!(claim.spec.resources.requests["storage"], "5G");
        assert_eq!(claim.spec.block_device_node_attributes.host_name, "worker-1");
        assert_eq!(
            claim.spec.device_claim_details.block_volume_mode,
            BlockVolumeMode::FileSystem
        );
        let labels = &claim.spec.selector.as_ref().unwrap().match_labels;
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["openebs.io/block-device-tag"], "mongo");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (cluster, reconciler) = setup();

        let first = reconciler.ensure(&request()).await.unwrap();
        let second = reconciler.ensure(&request()).await.unwrap();

        assert_eq!(first, "bdc-pvc-1");
        assert_eq!(first, second);
        assert_eq!(cluster.claims_created(), 1);
        assert_eq!(cluster.list_claims(NAMESPACE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_requires_hostname() {
        let (_cluster, reconciler) = setup();
        let mut req = request();
        req.hostname.clear();
        assert_matches!(reconciler.ensure(&req).await, Err(Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_bind_returns_device() {
        let (cluster, reconciler) = setup();
        cluster.bind_claim_after("bdc-pvc-1", "blockdevice-1", 2);
        cluster.add_block_device(
            NAMESPACE,
            BlockDevice::new(
                "blockdevice-1",
                BlockDeviceSpec {
                    path: "/dev/sdb".into(),
                    ..Default::default()
                },
            ),
        );

        let (claim, device) = reconciler
            .bind(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(claim, "bdc-pvc-1");
        assert_eq!(device.spec.path, "/dev/sdb");
        // lookup in ensure, then bound on the first poll
        assert_eq!(cluster.claim_reads("bdc-pvc-1"), 2);
    }

    #[tokio::test]
    async fn test_unbound_claim_is_released_after_retries() {
        let (cluster, reconciler) = setup();

        let err = reconciler
            .bind(&request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::NoBlockDeviceFound { claim, .. } if claim == "bdc-pvc-1");
        // one read from ensure, four polls, one read from release
        assert_eq!(cluster.claim_reads("bdc-pvc-1"), 6);
        assert!(cluster.list_claims(NAMESPACE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (cluster, reconciler) = setup();
        reconciler.ensure(&request()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler
            .wait_for_device("bdc-pvc-1", "pvc-1", &cancel)
            .await
            .unwrap_err();

        assert_matches!(err, Error::Cancelled(_));
        assert_eq!(cluster.list_claims(NAMESPACE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release() {
        let (cluster, reconciler) = setup();
        reconciler.ensure(&request()).await.unwrap();

        reconciler.release("bdc-pvc-1").await.unwrap();
        assert!(cluster.list_claims(NAMESPACE).await.unwrap().is_empty());

        // already gone
        reconciler.release("bdc-pvc-1").await.unwrap();
    }
}
