//! Kubernetes Cluster Adapter
//!
//! Implements [`ClusterClient`] on top of `kube::Api`.

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Adapter backed by a live Kubernetes client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create from the in-cluster or kubeconfig environment
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<BlockDeviceClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Render labels as an equality selector, e.g. `a=1,b=2`
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, "StorageClass", name))
    }

    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let selector = label_selector(labels);
        debug!("Listing nodes with selector {}", selector);
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(nodes.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::from_kube(e, "Pod", name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, "Pod", name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "Pod", name))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let pods = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(pods.items)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim> {
        self.claims(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim> {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }

    async fn replace_claim(
        &self,
        namespace: &str,
        claim: &BlockDeviceClaim,
    ) -> Result<BlockDeviceClaim> {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        self.claims(namespace)
            .replace(name, &PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, "BlockDeviceClaim", name))
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<BlockDeviceClaim>> {
        let claims = self.claims(namespace).list(&ListParams::default()).await?;
        Ok(claims.items)
    }

    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        let api: Api<BlockDevice> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, "BlockDevice", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("kubernetes.io/hostname".to_string(), "worker-1".to_string()),
            ("openebs.io/rack".to_string(), "r1".to_string()),
        ]);
        assert_eq!(
            label_selector(&labels),
            "kubernetes.io/hostname=worker-1,openebs.io/rack=r1"
        );
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
