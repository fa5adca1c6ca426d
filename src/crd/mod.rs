//! Custom Resource Definitions consumed by the provisioner
//!
//! This module contains the node device manager CRD types:
//! - BlockDevice: a raw device discovered on a node
//! - BlockDeviceClaim: a request binding one device to one Local PV

pub mod block_device;
pub mod block_device_claim;

pub use block_device::*;
pub use block_device_claim::*;
