//! Host-path volumes
//!
//! - [`path`]: volume path construction and safety checks
//! - [`quota`]: grace percentage to absolute limit conversion
//! - [`helper`]: helper pods doing the node-side work
//! - [`provisioner`]: the create/delete strategy

pub mod helper;
pub mod path;
pub mod provisioner;
pub mod quota;

pub use helper::{HelperOperation, HelperTask, HelperTaskExecutor};
pub use provisioner::HostPathProvisioner;
pub use quota::QuotaLimits;
