//! Cluster adapters
//!
//! - [`KubeCluster`]: live API server via `kube`
//! - `InMemoryCluster`: scripted in-memory cluster, test builds only

pub mod kubernetes;
#[cfg(test)]
pub mod memory;

pub use kubernetes::KubeCluster;
#[cfg(test)]
pub use memory::{HelperOutcome, InMemoryCluster};
