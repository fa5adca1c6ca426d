//! Domain layer - volume model and port definitions
//!
//! This module defines the cluster port that adapters implement and the
//! request/volume types the provisioning strategies exchange.

pub mod ports;
pub mod volume;

pub use ports::*;
pub use volume::*;
