//! Block-device volumes
//!
//! - [`claim`]: BlockDeviceClaim create/poll/release
//! - [`provisioner`]: the create/delete strategy

pub mod claim;
pub mod provisioner;

pub use claim::{claim_name, ClaimReconciler, ClaimRequest};
pub use provisioner::BlockDeviceProvisioner;
