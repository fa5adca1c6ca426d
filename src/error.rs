//! Error types for the Local PV provisioner
//!
//! Provides structured error types for every stage of a provision or delete
//! call: configuration resolution, path safety, quota arithmetic, helper
//! task execution, block device claims, and the Kubernetes API.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Volume Config Errors
    // =========================================================================
    #[error("Invalid {layer} config: {reason}")]
    InvalidConfigLayer { layer: String, reason: String },

    #[error("Cannot use deprecated \"{key}\" config option, use \"{replacement}\" instead")]
    DeprecatedOption { key: String, replacement: String },

    #[error("PV with StorageType {0} is not supported")]
    UnsupportedStorageType(String),

    // =========================================================================
    // Path Safety Errors
    // =========================================================================
    #[error("Unsafe volume path {path}: {reason}")]
    UnsafePath { path: String, reason: String },

    // =========================================================================
    // Quota Errors
    // =========================================================================
    #[error("Invalid format for limit grace: {0:?}")]
    InvalidQuotaFormat(String),

    #[error("Hard limit {hard} cannot be smaller than soft limit {soft}")]
    QuotaLimitOrder { soft: String, hard: String },

    // =========================================================================
    // Helper Task Errors
    // =========================================================================
    #[error("Invalid helper task options: {0}")]
    InvalidHelperOptions(String),

    #[error("Helper task {task} did not complete after {polls} polls")]
    HelperTimeout { task: String, polls: u32 },

    #[error("Helper task {task} failed: {reason}")]
    HelperFailed { task: String, reason: String },

    // =========================================================================
    // Block Device Errors
    // =========================================================================
    #[error("Unable to find BD for BDC {claim} associated with PV {volume}")]
    NoBlockDeviceFound { claim: String, volume: String },

    #[error("Block device claim {claim} error: {reason}")]
    BlockDeviceClaim { claim: String, reason: String },

    // =========================================================================
    // Provision Request Errors
    // =========================================================================
    #[error("Invalid volume request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error, no node was specified")]
    NoSelectedNode,

    #[error("Unable to determine node for labels {labels}: {reason}")]
    NodeLookup { labels: String, reason: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),
}

/// Outcome reported back to the outer provisioning controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    /// The call is final; the controller must not expect a volume later
    Finished,
    /// The request should be rescheduled onto another node
    Reschedule,
}

impl Error {
    /// Map this error to the state reported to the outer controller
    pub fn provisioning_state(&self) -> ProvisioningState {
        match self {
            Error::NoSelectedNode => ProvisioningState::Reschedule,
            _ => ProvisioningState::Finished,
        }
    }

    /// Check if a higher-level retry of the whole call may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Configuration(_)
                | Error::InvalidConfigLayer { .. }
                | Error::DeprecatedOption { .. }
                | Error::UnsupportedStorageType(_)
                | Error::UnsafePath { .. }
                | Error::InvalidQuotaFormat(_)
                | Error::QuotaLimitOrder { .. }
                | Error::InvalidHelperOptions(_)
                | Error::InvalidRequest(_)
                | Error::CapacityParse(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::HelperTimeout { .. } | Error::NoBlockDeviceFound { .. }
        )
    }

    /// Convert a Kubernetes API error, mapping 404/409 onto typed variants
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
