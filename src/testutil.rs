//! Shared fixtures for unit tests

use crate::config::ProvisionerConfig;
use crate::config::CAS_CONFIG_ANNOTATION;
use crate::domain::volume::{ACCESS_MODE_RWO, HOSTNAME_LABEL};
use k8s_openapi::api::core::v1::{
    Node, NodeSpec, PersistentVolumeClaim, PersistentVolumeClaimSpec, Taint,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "openebs";

/// Config with millisecond polls
pub fn config() -> Arc<ProvisionerConfig> {
    Arc::new(ProvisionerConfig {
        namespace: NAMESPACE.into(),
        service_account: "openebs-maya-operator".into(),
        helper_poll_interval: Duration::from_millis(1),
        helper_poll_count: 5,
        claim_poll_interval: Duration::from_millis(1),
        claim_retry_count: 4,
        ..Default::default()
    })
}

/// Node labelled with its hostname and carrying one NoSchedule taint
pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![Taint {
                key: "node-role.kubernetes.io/control-plane".into(),
                effect: "NoSchedule".into(),
                value: None,
                time_added: None,
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// RWO filesystem claim requesting `size`
pub fn claim(size: &str, storage_class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data-0".into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.into()),
            access_modes: Some(vec![ACCESS_MODE_RWO.into()]),
            volume_mode: Some("Filesystem".into()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.into()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Storage class carrying `cas_config` in its config annotation
pub fn storage_class(name: &str, cas_config: &str, reclaim_policy: Option<&str>) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: Some(BTreeMap::from([(
                CAS_CONFIG_ANNOTATION.to_string(),
                cas_config.to_string(),
            )])),
            ..Default::default()
        },
        provisioner: "openebs.io/local".into(),
        reclaim_policy: reclaim_policy.map(str::to_string),
        ..Default::default()
    }
}
