//! Process-wide provisioner configuration
//!
//! Built once at startup from CLI flags / environment and passed down to the
//! helper executor and the claim reconciler.

use super::cas::ConfigEntry;
use super::volume::KEY_BASE_PATH;
use crate::error::{Error, Result};
use std::time::Duration;

/// Image used for helper pods when none is configured
pub const DEFAULT_HELPER_IMAGE: &str = "openebs/linux-utils:latest";

/// Base path used when neither the StorageClass nor the PVC sets one
pub const DEFAULT_BASE_PATH: &str = "/var/openebs/local";

/// Configuration for the provisioner
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Namespace for helper pods and block device claims
    pub namespace: String,
    /// Image used for helper pods
    pub helper_image: String,
    /// Engine default BasePath
    pub default_base_path: String,
    /// Service account helper pods run as
    pub service_account: String,
    /// Image pull secrets attached to helper pods
    pub image_pull_secrets: Vec<String>,
    /// Run helper pods on the host network
    pub helper_host_network: bool,
    /// Interval between helper pod status checks
    pub helper_poll_interval: Duration,
    /// Number of helper pod status checks before giving up
    pub helper_poll_count: u32,
    /// Interval between block device claim checks
    pub claim_poll_interval: Duration,
    /// Number of block device claim checks before giving up
    pub claim_retry_count: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
            default_base_path: DEFAULT_BASE_PATH.to_string(),
            service_account: String::new(),
            image_pull_secrets: Vec::new(),
            helper_host_network: false,
            helper_poll_interval: Duration::from_secs(1),
            helper_poll_count: 120,
            claim_poll_interval: Duration::from_secs(5),
            claim_retry_count: 12,
        }
    }
}

impl ProvisionerConfig {
    /// Check the settings required before any volume can be served
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::Configuration(
                "Cannot start Provisioner: failed to get namespace".to_string(),
            ));
        }
        if self.helper_image.trim().is_empty() {
            return Err(Error::Configuration("helper image is empty".to_string()));
        }
        Ok(())
    }

    /// Engine default config layer, lowest precedence
    pub fn default_layer(&self) -> Vec<ConfigEntry> {
        vec![ConfigEntry::with_value(KEY_BASE_PATH, self.default_base_path.clone())]
    }
}

/// Split a comma separated list of image pull secret names
pub fn parse_image_pull_secrets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
