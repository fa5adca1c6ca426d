//! Local PV Provisioner
//!
//! Dynamic provisioning of node-local persistent volumes, backed either by a
//! directory under a base path on the node (hostpath) or by a whole block
//! device claimed through a BlockDeviceClaim (device).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Volume Controller                          │
//! │            (pending PVCs -> Provision, released PVs -> Delete)    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                           Provisioner                             │
//! │    request validation · layered config · strategy selection       │
//! ├────────────────────────────────┬─────────────────────────────────┤
//! │       HostPath strategy        │      Block device strategy      │
//! │  path check · quota · helpers  │  claim create · poll · release  │
//! ├────────────────────────────────┴─────────────────────────────────┤
//! │                     ClusterClient (port)                          │
//! │        KubeCluster (API server) · InMemoryCluster (tests)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioner`]: provision/delete entry points
//! - [`config`]: process and per-volume configuration
//! - [`hostpath`]: directory backed volumes and helper pods
//! - [`blockdevice`]: block device claims
//! - [`cluster`]: Kubernetes access behind [`domain::ports::ClusterClient`]
//! - [`controller`]: reconcile loop used by the binary
//! - [`crd`]: BlockDevice and BlockDeviceClaim resources
//! - [`error`]: Error types and handling

pub mod blockdevice;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hostpath;
pub mod metrics;
pub mod provisioner;
pub mod quantity;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use blockdevice::{BlockDeviceProvisioner, ClaimReconciler, ClaimRequest};

pub use cluster::KubeCluster;

pub use config::{ProvisionerConfig, StorageKind, VolumeConfig};

pub use controller::{ControllerConfig, VolumeController};

pub use crd::{BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceSpec};

pub use domain::ports::{ClusterClient, ClusterClientRef, VolumeStrategy};
pub use domain::volume::{LocalVolume, ProvisionRequest, VolumeKind, VolumeRecord};

pub use error::{Error, ProvisioningState, Result};

pub use hostpath::{HelperTaskExecutor, HostPathProvisioner};

pub use metrics::ProvisionerMetrics;

pub use provisioner::Provisioner;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
