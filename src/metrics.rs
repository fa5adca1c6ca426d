//! Provisioner Metrics
//!
//! Operation counters labelled by storage type, registered into a caller
//! supplied registry so tests can use a private one. The label only ever
//! takes a supported storage type or `unknown`.

use crate::config::StorageKind;
use prometheus::{IntCounterVec, Opts, Registry};

const STORAGE_TYPE_LABEL: &str = "storage_type";

/// Label for requests whose storage type is unset or unsupported
pub const UNKNOWN_STORAGE_TYPE: &str = "unknown";

fn storage_type_label(kind: Option<StorageKind>) -> &'static str {
    match kind {
        Some(StorageKind::HostPath) => "hostpath",
        Some(StorageKind::Device) => "device",
        None => UNKNOWN_STORAGE_TYPE,
    }
}

/// Counters for provision and delete calls
#[derive(Clone)]
pub struct ProvisionerMetrics {
    provision_total: IntCounterVec,
    provision_failures: IntCounterVec,
    delete_total: IntCounterVec,
    delete_failures: IntCounterVec,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), &[STORAGE_TYPE_LABEL])
}

impl ProvisionerMetrics {
    /// Create the counters and register them into `registry`
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            provision_total: counter(
                "localpv_provision_total",
                "Total volume provision calls",
            )?,
            provision_failures: counter(
                "localpv_provision_failures_total",
                "Failed volume provision calls",
            )?,
            delete_total: counter("localpv_delete_total", "Total volume delete calls")?,
            delete_failures: counter(
                "localpv_delete_failures_total",
                "Failed volume delete calls",
            )?,
        };

        registry.register(Box::new(metrics.provision_total.clone()))?;
        registry.register(Box::new(metrics.provision_failures.clone()))?;
        registry.register(Box::new(metrics.delete_total.clone()))?;
        registry.register(Box::new(metrics.delete_failures.clone()))?;

        Ok(metrics)
    }

    /// Record a provision call; `None` when no supported kind was resolved
    pub fn observe_provision(&self, kind: Option<StorageKind>, ok: bool) {
        let storage_type = storage_type_label(kind);
        self.provision_total.with_label_values(&[storage_type]).inc();
        if !ok {
            self.provision_failures.with_label_values(&[storage_type]).inc();
        }
    }

    pub fn observe_delete(&self, kind: StorageKind, ok: bool) {
        let storage_type = storage_type_label(Some(kind));
        self.delete_total.with_label_values(&[storage_type]).inc();
        if !ok {
            self.delete_failures.with_label_values(&[storage_type]).inc();
        }
    }

    pub fn provision_count(&self, storage_type: &str) -> u64 {
        self.provision_total.with_label_values(&[storage_type]).get()
    }

    pub fn provision_failure_count(&self, storage_type: &str) -> u64 {
        self.provision_failures.with_label_values(&[storage_type]).get()
    }

    pub fn delete_count(&self, storage_type: &str) -> u64 {
        self.delete_total.with_label_values(&[storage_type]).get()
    }

    pub fn delete_failure_count(&self, storage_type: &str) -> u64 {
        self.delete_failures.with_label_values(&[storage_type]).get()
    }
}
