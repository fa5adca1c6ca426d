//! Domain Ports - Cluster access used by the provisioning engine
//!
//! The engine never talks to the API server directly. Everything goes through
//! [`ClusterClient`], implemented by [`crate::cluster::KubeCluster`] in
//! production and the scripted `InMemoryCluster` in tests.

use super::volume::{LocalVolume, ProvisionRequest, VolumeRecord};
use crate::config::VolumeConfig;
use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for the Kubernetes objects the provisioner reads and writes.
///
/// Lookups of missing objects return [`crate::Error::ResourceNotFound`] and
/// creates of existing objects return [`crate::Error::ResourceExists`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // Storage classes and nodes

    /// Get a storage class by name
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;

    /// List nodes carrying every label in `labels`
    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    // Helper pods

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    // Block device claims

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim>;

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim>;

    /// Replace a claim, used to update its finalizers
    async fn replace_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_claims(&self, namespace: &str) -> Result<Vec<BlockDeviceClaim>>;

    // Block devices

    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice>;
}

// =============================================================================
// Volume Strategy Port
// =============================================================================

/// Everything a strategy needs for one provisioning call
#[derive(Debug, Clone, Copy)]
pub struct ProvisionContext<'a> {
    pub request: &'a ProvisionRequest,
    pub config: &'a VolumeConfig,
    /// Storage class the claim was made against
    pub storage_class: &'a str,
    /// Reclaim policy copied onto the volume
    pub reclaim_policy: &'a str,
}

/// Materializes and releases one kind of local volume
#[async_trait]
pub trait VolumeStrategy: Send + Sync {
    /// Create the backing storage and describe the resulting volume
    async fn provision(
        &self,
        ctx: ProvisionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<LocalVolume>;

    /// Release the backing storage of a volume being deleted
    async fn delete(&self, record: &VolumeRecord, cancel: &CancellationToken) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterClientRef = Arc<dyn ClusterClient>;
pub type VolumeStrategyRef = Arc<dyn VolumeStrategy>;
