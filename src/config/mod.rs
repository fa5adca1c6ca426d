//! Configuration
//!
//! - [`cas`]: layered CAS config entries and their merge rules
//! - [`volume`]: the resolved per-volume view
//! - [`provisioner`]: process-wide settings

pub mod cas;
pub mod provisioner;
pub mod volume;

pub use cas::{ConfigEntry, CAS_CONFIG_ANNOTATION};
pub use provisioner::{
    parse_image_pull_secrets, ProvisionerConfig, DEFAULT_BASE_PATH, DEFAULT_HELPER_IMAGE,
};
pub use volume::{QuotaGrace, StorageKind, VolumeConfig};
