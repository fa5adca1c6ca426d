//! Host-path provisioning
//!
//! Create: validate path, run the init helper, then the quota helper when a
//! quota entry is enabled. Delete: find the node again by the recorded
//! affinity labels (its taints may have changed) and run the cleanup helper.
//!
//! A quota failure leaves the already-created directory in place; the call
//! still fails and no volume is returned.

use super::helper::{HelperOperation, HelperTask, HelperTaskExecutor};
use super::quota;
use crate::config::ProvisionerConfig;
use crate::domain::ports::{ClusterClientRef, ProvisionContext, VolumeStrategy};
use crate::domain::volume::{LocalVolume, VolumeKind, VolumeRecord, VOLUME_MODE_FILESYSTEM};
use crate::error::{Error, Result};
use crate::quantity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Provisioner for directory backed volumes
pub struct HostPathProvisioner {
    cluster: ClusterClientRef,
    executor: HelperTaskExecutor,
}

impl HostPathProvisioner {
    pub fn new(cluster: ClusterClientRef, config: Arc<ProvisionerConfig>) -> Self {
        Self {
            executor: HelperTaskExecutor::new(cluster.clone(), config),
            cluster,
        }
    }
}

fn taints(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

/// Find the single node carrying all `labels`
pub async fn find_node(cluster: &ClusterClientRef, labels: &BTreeMap<String, String>) -> Result<Node> {
    let lookup_error = |reason: &str| Error::NodeLookup {
        labels: format!("{:?}", labels),
        reason: reason.to_string(),
    };

    let mut nodes = cluster
        .list_nodes(labels)
        .await
        .map_err(|e| lookup_error(&e.to_string()))?;

    match nodes.len() {
        0 => Err(lookup_error("no node matches the labels")),
        1 => Ok(nodes.remove(0)),
        _ => Err(lookup_error("found multiple nodes matching the labels")),
    }
}

#[async_trait]
impl VolumeStrategy for HostPathProvisioner {
    async fn provision(
        &self,
        ctx: ProvisionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<LocalVolume> {
        let request = ctx.request;
        let config = ctx.config;
        let name = request.volume_name.as_str();

        let node = request.selected_node.as_ref().ok_or(Error::NoSelectedNode)?;
        let node_affinity = request.node_affinity_labels(config.node_affinity_label_keys())?;
        let path = config.path()?;
        let mode = config.fs_mode()?;

        info!(
            "Creating volume {} at node with labels {:?}, path: {}",
            name, node_affinity, path
        );

        let mut task = HelperTask {
            operation: HelperOperation::Init { mode },
            volume_name: name.to_string(),
            path: path.clone(),
            node_affinity: node_affinity.clone(),
            taints: taints(node),
        };

        if let Err(e) = self.executor.run(&task, cancel).await {
            info!("Initialize volume {} failed: {}", name, e);
            return Err(e);
        }

        if let Some(grace) = config.quota_grace() {
            let capacity = request.requested_storage().ok_or_else(|| {
                Error::InvalidRequest(format!("claim for {} has no storage request", name))
            })?;
            let bytes = quantity::parse_bytes(capacity)?;
            let limits = quota::resolve_limits(&grace, bytes)?;

            task.operation = HelperOperation::Quota { limits };
            if let Err(e) = self.executor.run(&task, cancel).await {
                warn!("Applying quota on {} failed: {}", name, e);
                return Err(e);
            }
            info!("Successfully applied quota on {}", name);
        }

        Ok(LocalVolume {
            name: name.to_string(),
            kind: VolumeKind::HostPath { path },
            node_affinity,
            capacity: request.requested_storage().cloned(),
            access_modes: request.access_modes(),
            reclaim_policy: ctx.reclaim_policy.to_string(),
            volume_mode: VOLUME_MODE_FILESYSTEM.to_string(),
            storage_class: Some(ctx.storage_class.to_string()),
        })
    }

    async fn delete(&self, record: &VolumeRecord, cancel: &CancellationToken) -> Result<()> {
        let path = record
            .path
            .clone()
            .ok_or_else(|| Error::InvalidRequest(format!("no HostPath set on {}", record.name)))?;

        if record.node_affinity.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "cannot find affinited node details on {}",
                record.name
            )));
        }

        let node = find_node(&self.cluster, &record.node_affinity).await?;
        info!(
            "Deleting volume {} at {}:{}",
            record.name,
            node.metadata.name.as_deref().unwrap_or_default(),
            path
        );

        let task = HelperTask {
            operation: HelperOperation::Cleanup,
            volume_name: record.name.clone(),
            path,
            node_affinity: record.node_affinity.clone(),
            taints: taints(&node),
        };
        self.executor.run(&task, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HelperOutcome, InMemoryCluster};
    use crate::config::VolumeConfig;
    use crate::domain::ports::ClusterClient;
    use crate::domain::volume::{ProvisionRequest, RECLAIM_DELETE};
    use crate::testutil;
    use assert_matches::assert_matches;

    fn setup() -> (Arc<InMemoryCluster>, HostPathProvisioner) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node(testutil::node("worker-1"));
        let provisioner = HostPathProvisioner::new(cluster.clone(), testutil::config());
        (cluster, provisioner)
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest::new(
            "pvc-1",
            testutil::claim("5G", "openebs-hostpath"),
            Some(testutil::node("worker-1")),
        )
    }

    fn resolve(class_layer: &str) -> VolumeConfig {
        VolumeConfig::resolve("pvc-1", testutil::config().default_layer(), class_layer, "").unwrap()
    }

    fn ctx<'a>(request: &'a ProvisionRequest, config: &'a VolumeConfig) -> ProvisionContext<'a> {
        ProvisionContext {
            request,
            config,
            storage_class: "openebs-hostpath",
            reclaim_policy: RECLAIM_DELETE,
        }
    }

    fn command(pod: &k8s_openapi::api::core::v1::Pod) -> Vec<String> {
        pod.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_provision_creates_directory() {
        let (cluster, provisioner) = setup();
        let request = request();
        let config = resolve("");

        let volume = provisioner
            .provision(ctx(&request, &config), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(volume.kind, VolumeKind::HostPath { path: "/var/openebs/local/pvc-1".into() });
        assert_eq!(volume.node_affinity["kubernetes.io/hostname"], "worker-1");
        assert_eq!(volume.volume_mode, "Filesystem");

        let pods = cluster.created_pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("init-pvc-1"));
        assert_eq!(command(&pods[0]), vec!["mkdir", "-m", "0777", "-p", "/data/pvc-1"]);
        assert!(cluster.list_pods("openebs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provision_with_quota() {
        let (cluster, provisioner) = setup();
        let request = request();
        let config = resolve(
            "- name: XFSQuota\n  enabled: \"true\"\n  data:\n    softLimitGrace: \"0%\"\n    hardLimitGrace: \"100%\"\n",
        );

        provisioner
            .provision(ctx(&request, &config), &CancellationToken::new())
            .await
            .unwrap();

        let pods = cluster.created_pods();
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[1].metadata.name.as_deref(), Some("quota-pvc-1"));
        assert!(command(&pods[1])[2].contains("bsoft=4882813k bhard=9765625k"));
    }

    #[tokio::test]
    async fn test_quota_failure_keeps_directory() {
        let (cluster, provisioner) = setup();
        cluster.script_helper("quota-pvc-1", HelperOutcome::Fail);
        let request = request();
        let config = resolve("- name: EXT4Quota\n  enabled: \"true\"\n");

        let err = provisioner
            .provision(ctx(&request, &config), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::HelperFailed { .. });
        let names: Vec<_> = cluster
            .created_pods()
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["init-pvc-1", "quota-pvc-1"]);
        assert!(cluster.list_pods("openebs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_quota_rejected_after_init() {
        let (cluster, provisioner) = setup();
        let request = request();
        let config = resolve(
            "- name: XFSQuota\n  enabled: \"true\"\n  data:\n    softLimitGrace: \"80%\"\n    hardLimitGrace: \"75%\"\n",
        );

        let err = provisioner
            .provision(ctx(&request, &config), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::QuotaLimitOrder { .. });
        assert_eq!(cluster.created_pods().len(), 1);
    }

    #[tokio::test]
    async fn test_unsafe_base_path_launches_nothing() {
        let (cluster, provisioner) = setup();
        let request = request();
        let config = resolve("- name: BasePath\n  value: /\n");

        let err = provisioner
            .provision(ctx(&request, &config), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::UnsafePath { .. });
        assert!(cluster.created_pods().is_empty());
    }

    #[tokio::test]
    async fn test_delete_runs_cleanup_on_recorded_node() {
        let (cluster, provisioner) = setup();
        let record = VolumeRecord {
            name: "pvc-1".into(),
            kind: crate::config::StorageKind::HostPath,
            path: Some("/var/openebs/local/pvc-1".into()),
            node_affinity: BTreeMap::from([(
                "kubernetes.io/hostname".to_string(),
                "worker-1".to_string(),
            )]),
            claim_name: None,
            reclaim_policy: RECLAIM_DELETE.into(),
        };

        provisioner.delete(&record, &CancellationToken::new()).await.unwrap();

        let pods = cluster.created_pods();
        assert_eq!(pods[0].metadata.name.as_deref(), Some("cleanup-pvc-1"));
        assert_eq!(command(&pods[0]), vec!["rm", "-rf", "/data/pvc-1"]);
        let tolerations = pods[0].spec.as_ref().unwrap().tolerations.clone().unwrap();
        assert_eq!(tolerations.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_requires_unique_node() {
        let (cluster, provisioner) = setup();
        let record = VolumeRecord {
            name: "pvc-1".into(),
            kind: crate::config::StorageKind::HostPath,
            path: Some("/var/openebs/local/pvc-1".into()),
            node_affinity: BTreeMap::from([("openebs.io/rack".to_string(), "r1".to_string())]),
            claim_name: None,
            reclaim_policy: RECLAIM_DELETE.into(),
        };

        let err = provisioner.delete(&record, &CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::NodeLookup { .. });

        for name in ["worker-2", "worker-3"] {
            let mut node = testutil::node(name);
            node.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("openebs.io/rack".into(), "r1".into());
            cluster.add_node(node);
        }

        let err = provisioner.delete(&record, &CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::NodeLookup { reason, .. } if reason.contains("multiple"));
        assert!(cluster.created_pods().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_path_fails() {
        let (_cluster, provisioner) = setup();
        let record = VolumeRecord {
            name: "pvc-1".into(),
            kind: crate::config::StorageKind::HostPath,
            path: None,
            node_affinity: BTreeMap::new(),
            claim_name: None,
            reclaim_policy: RECLAIM_DELETE.into(),
        };
        let err = provisioner.delete(&record, &CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::InvalidRequest(_));
    }
}
