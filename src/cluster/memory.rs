//! In-Memory Cluster
//!
//! A scripted stand-in for the API server. Helper pods finish according to a
//! per-pod [`HelperOutcome`], and block device claims bind after a configured
//! number of reads, so the provisioning state machines can be driven through
//! every path without a cluster.

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodStatus};
use k8s_openapi::api::storage::v1::StorageClass;
use parking_lot::Mutex;
use std::collections::BTreeMap;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =============================================================================
// Scripting
// =============================================================================

/// Terminal state a helper pod reaches once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelperOutcome {
    #[default]
    Succeed,
    Fail,
    /// Stays Running forever
    NeverComplete,
}

impl HelperOutcome {
    fn phase(&self) -> &'static str {
        match self {
            HelperOutcome::Succeed => "Succeeded",
            HelperOutcome::Fail => "Failed",
            HelperOutcome::NeverComplete => "Running",
        }
    }
}

#[derive(Debug, Clone)]
struct ClaimBinding {
    device: String,
    after_reads: u32,
}

#[derive(Default)]
struct State {
    storage_classes: BTreeMap<String, StorageClass>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    claims: BTreeMap<Key, BlockDeviceClaim>,
    block_devices: BTreeMap<Key, BlockDevice>,

    default_outcome: HelperOutcome,
    outcomes: BTreeMap<String, HelperOutcome>,
    bindings: BTreeMap<String, ClaimBinding>,
    claim_reads: BTreeMap<String, u32>,

    created_pods: Vec<Pod>,
    deleted_pods: Vec<String>,
    claims_created: u32,
    fail_pod_deletes: bool,
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding

    pub fn add_storage_class(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.state.lock().storage_classes.insert(name, class);
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state.lock().nodes.insert(name, node);
    }

    pub fn add_block_device(&self, namespace: &str, device: BlockDevice) {
        let name = device.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .block_devices
            .insert(key(namespace, &name), device);
    }

    pub fn add_claim(&self, namespace: &str, claim: BlockDeviceClaim) {
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.state.lock().claims.insert(key(namespace, &name), claim);
    }

    pub fn add_pod(&self, namespace: &str, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state.lock().pods.insert(key(namespace, &name), pod);
    }

    // Scripting

    /// Outcome for helper pods without a specific script
    pub fn set_default_outcome(&self, outcome: HelperOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    /// Outcome for the helper pod named `pod`
    pub fn script_helper(&self, pod: &str, outcome: HelperOutcome) {
        self.state.lock().outcomes.insert(pod.to_string(), outcome);
    }

    /// Bind claim `claim` to `device` on its `after_reads`-th read
    pub fn bind_claim_after(&self, claim: &str, device: &str, after_reads: u32) {
        self.state.lock().bindings.insert(
            claim.to_string(),
            ClaimBinding {
                device: device.to_string(),
                after_reads,
            },
        );
    }

    /// Make every pod delete fail
    pub fn fail_pod_deletes(&self, fail: bool) {
        self.state.lock().fail_pod_deletes = fail;
    }

    // Observation

    /// Every pod passed to `create_pod`, in order
    pub fn created_pods(&self) -> Vec<Pod> {
        self.state.lock().created_pods.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted_pods.clone()
    }

    pub fn claims_created(&self) -> u32 {
        self.state.lock().claims_created
    }

    /// Number of reads of claim `name`
    pub fn claim_reads(&self, name: &str) -> u32 {
        self.state.lock().claim_reads.get(name).copied().unwrap_or(0)
    }

    fn not_found(kind: &str, name: &str) -> Error {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

fn matches_labels(node: &Node, labels: &BTreeMap<String, String>) -> bool {
    let node_labels = node.metadata.labels.as_ref();
    labels.iter().all(|(k, v)| {
        node_labels
            .and_then(|l| l.get(k))
            .map(|x| x == v)
            .unwrap_or(false)
    })
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.state
            .lock()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found("StorageClass", name))
    }

    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| matches_labels(n, labels))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        let k = key(namespace, &name);
        if state.pods.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: "Pod".to_string(),
                name,
            });
        }

        let outcome = state
            .outcomes
            .get(&name)
            .copied()
            .unwrap_or(state.default_outcome);

        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.status = Some(PodStatus {
            phase: Some(outcome.phase().to_string()),
            ..Default::default()
        });

        state.created_pods.push(pod.clone());
        state.pods.insert(k, created.clone());
        Ok(created)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.state
            .lock()
            .pods
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("Pod", name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_pod_deletes {
            return Err(Error::Internal(format!("injected delete failure for pod {}", name)));
        }
        state
            .pods
            .remove(&key(namespace, name))
            .ok_or_else(|| Self::not_found("Pod", name))?;
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim> {
        let mut state = self.state.lock();
        let reads = {
            let reads = state.claim_reads.entry(name.to_string()).or_insert(0);
            *reads += 1;
            *reads
        };
        let binding = state.bindings.get(name).cloned();

        let claim = state
            .claims
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::not_found("BlockDeviceClaim", name))?;

        if let Some(binding) = binding {
            if reads >= binding.after_reads && claim.bound_device().is_none() {
                claim.spec.block_device_name = binding.device;
            }
        }
        Ok(claim.clone())
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        let k = key(namespace, &name);
        if state.claims.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: "BlockDeviceClaim".to_string(),
                name,
            });
        }
        let mut created = claim.clone();
        created.metadata.namespace = Some(namespace.to_string());
        state.claims.insert(k, created.clone());
        state.claims_created += 1;
        Ok(created)
    }

    async fn replace_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        let slot = state
            .claims
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| Self::not_found("BlockDeviceClaim", &name))?;
        *slot = claim.clone();
        Ok(claim.clone())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .claims
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| Self::not_found("BlockDeviceClaim", name))
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<BlockDeviceClaim>> {
        Ok(self
            .state
            .lock()
            .claims
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        self.state
            .lock()
            .block_devices
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("BlockDevice", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BlockDeviceClaimSpec;
    use kube::api::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pod_outcomes() {
        let cluster = InMemoryCluster::new();
        cluster.script_helper("quota-pvc-1", HelperOutcome::Fail);

        let ok = cluster.create_pod("openebs", &pod("init-pvc-1")).await.unwrap();
        assert_eq!(ok.status.unwrap().phase.as_deref(), Some("Succeeded"));

        let failed = cluster.create_pod("openebs", &pod("quota-pvc-1")).await.unwrap();
        assert_eq!(failed.status.unwrap().phase.as_deref(), Some("Failed"));

        let dup = cluster.create_pod("openebs", &pod("init-pvc-1")).await;
        assert!(matches!(dup, Err(Error::ResourceExists { .. })));

        cluster.delete_pod("openebs", "init-pvc-1").await.unwrap();
        assert_eq!(cluster.list_pods("openebs").await.unwrap().len(), 1);
        assert_eq!(cluster.deleted_pods(), vec!["init-pvc-1".to_string()]);
    }

    #[tokio::test]
    async fn test_claim_binds_after_reads() {
        let cluster = InMemoryCluster::new();
        cluster.bind_claim_after("bdc-pvc-1", "blockdevice-1", 2);
        cluster
            .create_claim(
                "openebs",
                &BlockDeviceClaim::new("bdc-pvc-1", BlockDeviceClaimSpec::default()),
            )
            .await
            .unwrap();

        let first = cluster.get_claim("openebs", "bdc-pvc-1").await.unwrap();
        assert!(first.bound_device().is_none());
        let second = cluster.get_claim("openebs", "bdc-pvc-1").await.unwrap();
        assert_eq!(second.bound_device(), Some("blockdevice-1"));
        assert_eq!(cluster.claim_reads("bdc-pvc-1"), 2);
    }
}
