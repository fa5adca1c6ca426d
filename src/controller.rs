//! Volume Controller
//!
//! Periodic reconcile loop driving the [`Provisioner`]:
//! - pending PVCs of our storage classes that carry a selected node get a
//!   volume and a PV bound to the claim
//! - released PVs we provisioned with a Delete reclaim policy are deleted,
//!   then the PV object is removed
//!
//! Each pass is sequential, so create and delete never race for one volume.
//! A claim whose last provision failed with a non-retryable error is skipped
//! until its resourceVersion changes.

use crate::domain::volume::{ProvisionRequest, RECLAIM_DELETE};
use crate::error::{Error, ProvisioningState, Result};
use crate::provisioner::Provisioner;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Provisioner name in storage classes and on provisioned PVs
pub const PROVISIONER_NAME: &str = "openebs.io/local";
/// Node picked by the scheduler for a WaitForFirstConsumer claim
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";
/// Provisioner that created a PV
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub provisioner_name: String,
    /// Time between reconcile passes
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provisioner_name: PROVISIONER_NAME.to_string(),
            resync_interval: Duration::from_secs(10),
        }
    }
}

/// Claims parked after a non-retryable failure, keyed by uid
#[derive(Debug, Default)]
pub struct FailedClaims {
    parked: Mutex<HashMap<String, String>>,
}

impl FailedClaims {
    /// True while the claim is unchanged since it was parked
    pub fn is_parked(&self, claim: &PersistentVolumeClaim) -> bool {
        let (Some(uid), Some(version)) = claim_version(claim) else {
            return false;
        };
        self.parked.lock().get(uid).is_some_and(|v| v == version)
    }

    /// Park the claim if `err` cannot clear without a change to it
    pub fn record(&self, claim: &PersistentVolumeClaim, err: &Error) {
        if err.is_retryable() {
            return;
        }
        if let (Some(uid), Some(version)) = claim_version(claim) {
            self.parked.lock().insert(uid.to_string(), version.to_string());
        }
    }

    pub fn clear(&self, claim: &PersistentVolumeClaim) {
        if let Some(uid) = claim.metadata.uid.as_deref() {
            self.parked.lock().remove(uid);
        }
    }

    /// Forget claims that no longer exist
    pub fn retain_listed(&self, claims: &[PersistentVolumeClaim]) {
        self.parked.lock().retain(|uid, _| {
            claims
                .iter()
                .any(|c| c.metadata.uid.as_deref() == Some(uid.as_str()))
        });
    }
}

fn claim_version(claim: &PersistentVolumeClaim) -> (Option<&str>, Option<&str>) {
    (
        claim.metadata.uid.as_deref(),
        claim.metadata.resource_version.as_deref(),
    )
}

/// Reconciles PVCs and PVs against the provisioner
pub struct VolumeController {
    client: Client,
    provisioner: Arc<Provisioner>,
    config: ControllerConfig,
    failed: FailedClaims,
}

impl VolumeController {
    pub fn new(client: Client, provisioner: Arc<Provisioner>, config: ControllerConfig) -> Self {
        Self {
            client,
            provisioner,
            config,
            failed: FailedClaims::default(),
        }
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Starting volume controller for {} (resync every {:?})",
            self.config.provisioner_name, self.config.resync_interval
        );

        loop {
            if let Err(e) = self.reconcile_once(&cancel).await {
                error!("Reconcile pass failed: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Volume controller stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.resync_interval) => {}
            }
        }
    }

    /// One pass over claims and volumes
    pub async fn reconcile_once(&self, cancel: &CancellationToken) -> Result<()> {
        let classes = self.our_storage_classes().await?;

        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let claims = claims.list(&ListParams::default()).await?.items;
        self.failed.retain_listed(&claims);
        for claim in claims {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if claim_needs_volume(&claim, &classes) {
                self.provision_claim(claim, cancel).await;
            }
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        for pv in volumes.list(&ListParams::default()).await?.items {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if is_released(&pv, &self.config.provisioner_name) {
                self.delete_volume(pv, cancel).await;
            }
        }
        Ok(())
    }

    async fn our_storage_classes(&self) -> Result<Vec<String>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|sc| sc.provisioner == self.config.provisioner_name)
            .filter_map(|sc| sc.metadata.name)
            .collect())
    }

    async fn provision_claim(&self, claim: PersistentVolumeClaim, cancel: &CancellationToken) {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let claim_name = claim.metadata.name.clone().unwrap_or_default();
        let Some(volume_name) = volume_name(&claim) else {
            warn!("Claim {}/{} has no uid, skipping", namespace, claim_name);
            return;
        };
        if self.failed.is_parked(&claim) {
            debug!("Claim {}/{} unchanged since last failure, skipping", namespace, claim_name);
            return;
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        match volumes.get_opt(&volume_name).await {
            Ok(Some(_)) => {
                debug!("Volume {} already exists for {}/{}", volume_name, namespace, claim_name);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Unable to look up volume {}: {}", volume_name, e);
                return;
            }
        }

        let node = match self.selected_node(&claim).await {
            Ok(node) => node,
            Err(e) => {
                warn!("Unable to get selected node for {}/{}: {}", namespace, claim_name, e);
                None
            }
        };

        let request = ProvisionRequest::new(volume_name.clone(), claim.clone(), node);
        let volume = match self.provisioner.provision(&request, cancel).await {
            Ok(volume) => volume,
            Err(e) => {
                if e.provisioning_state() == ProvisioningState::Reschedule {
                    self.reschedule(&namespace, &claim_name).await;
                } else if !e.is_retryable() {
                    warn!(
                        "Claim {}/{} will not be retried until it changes: {}",
                        namespace, claim_name, e
                    );
                }
                self.failed.record(&claim, &e);
                return;
            }
        };
        self.failed.clear(&claim);

        let pv = bind_to_claim(
            volume.to_persistent_volume(),
            &claim,
            &self.config.provisioner_name,
        );
        match volumes.create(&PostParams::default(), &pv).await {
            Ok(_) => info!("Created PV {} for {}/{}", volume_name, namespace, claim_name),
            Err(e) => error!("Unable to create PV {}: {}", volume_name, e),
        }
    }

    async fn selected_node(&self, claim: &PersistentVolumeClaim) -> Result<Option<Node>> {
        let Some(name) = annotation(claim.metadata.annotations.as_ref(), SELECTED_NODE_ANNOTATION)
        else {
            return Ok(None);
        };
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "Node", name))
    }

    /// Drop the selected node so the scheduler picks again
    async fn reschedule(&self, namespace: &str, claim_name: &str) {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { SELECTED_NODE_ANNOTATION: null } }
        });
        match claims
            .patch(claim_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Rescheduling claim {}/{}", namespace, claim_name),
            Err(e) => warn!("Unable to reschedule claim {}/{}: {}", namespace, claim_name, e),
        }
    }

    async fn delete_volume(&self, pv: PersistentVolume, cancel: &CancellationToken) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        if let Err(e) = self.provisioner.delete(&pv, cancel).await {
            if e.is_transient() {
                warn!("Volume {} not deleted, will retry: {}", name, e);
            } else {
                error!("Volume {} not deleted, needs attention: {}", name, e);
            }
            return;
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        match volumes.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Removed PV {}", name),
            Err(e) => match Error::from_kube(e, "PersistentVolume", &name) {
                e if e.is_not_found() => {}
                e => error!("Unable to remove PV {}: {}", name, e),
            },
        }
    }
}

fn annotation<'a>(annotations: Option<&'a BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    annotations
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Name of the PV provisioned for `claim`
pub fn volume_name(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .map(|uid| format!("pvc-{}", uid))
}

/// Pending, unbound, made against one of `classes` and scheduled onto a node
pub fn claim_needs_volume(claim: &PersistentVolumeClaim, classes: &[String]) -> bool {
    if claim.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let pending = claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map_or(true, |p| p == "Pending");
    let unbound = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .map_or(true, str::is_empty);
    let scheduled = annotation(claim.metadata.annotations.as_ref(), SELECTED_NODE_ANNOTATION).is_some();

    let request = ProvisionRequest::new("", claim.clone(), None);
    let ours = request
        .storage_class_name()
        .is_some_and(|sc| classes.iter().any(|c| c == sc));

    pending && unbound && scheduled && ours
}

/// Released, reclaimed by deletion and carrying our provisioned-by annotation.
///
/// Retained volumes are left to the administrator, PV object included.
pub fn is_released(pv: &PersistentVolume, provisioner_name: &str) -> bool {
    let released = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Released");
    let reclaim_delete = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .is_some_and(|p| p == RECLAIM_DELETE);
    let ours = annotation(pv.metadata.annotations.as_ref(), PROVISIONED_BY_ANNOTATION)
        == Some(provisioner_name);
    released && reclaim_delete && ours && pv.metadata.deletion_timestamp.is_none()
}

/// Pre-bind `pv` to `claim` and mark it as ours
pub fn bind_to_claim(
    mut pv: PersistentVolume,
    claim: &PersistentVolumeClaim,
    provisioner_name: &str,
) -> PersistentVolume {
    pv.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PROVISIONED_BY_ANNOTATION.to_string(), provisioner_name.to_string());

    if let Some(spec) = pv.spec.as_mut() {
        spec.claim_ref = Some(ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("PersistentVolumeClaim".to_string()),
            name: claim.metadata.name.clone(),
            namespace: claim.metadata.namespace.clone(),
            uid: claim.metadata.uid.clone(),
            resource_version: claim.metadata.resource_version.clone(),
            ..Default::default()
        });
    }
    pv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{LocalVolume, VolumeKind, BDC_ANNOTATION, RECLAIM_RETAIN};
    use crate::testutil;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimStatus, PersistentVolumeStatus};

    fn scheduled_claim() -> PersistentVolumeClaim {
        let mut claim = testutil::claim("5G", "openebs-hostpath");
        claim.metadata.uid = Some("1234".into());
        claim.metadata.annotations = Some(BTreeMap::from([(
            SELECTED_NODE_ANNOTATION.to_string(),
            "worker-1".to_string(),
        )]));
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });
        claim
    }

    #[test]
    fn test_volume_name() {
        assert_eq!(volume_name(&scheduled_claim()).as_deref(), Some("pvc-1234"));
        assert_eq!(volume_name(&testutil::claim("5G", "x")), None);
    }

    #[test]
    fn test_claim_needs_volume() {
        let classes = vec!["openebs-hostpath".to_string()];
        assert!(claim_needs_volume(&scheduled_claim(), &classes));
        assert!(!claim_needs_volume(&scheduled_claim(), &["other".to_string()]));

        let mut unscheduled = scheduled_claim();
        unscheduled.metadata.annotations = None;
        assert!(!claim_needs_volume(&unscheduled, &classes));

        let mut bound = scheduled_claim();
        bound.spec.as_mut().unwrap().volume_name = Some("pvc-1234".into());
        assert!(!claim_needs_volume(&bound, &classes));
    }

    fn device_volume(reclaim_policy: &str) -> LocalVolume {
        LocalVolume {
            name: "pvc-1234".into(),
            kind: VolumeKind::Device {
                path: "/dev/sdb".into(),
                fs_type: None,
                claim_name: "bdc-pvc-1234".into(),
            },
            node_affinity: BTreeMap::new(),
            capacity: None,
            access_modes: vec!["ReadWriteOnce".into()],
            reclaim_policy: reclaim_policy.into(),
            volume_mode: "Filesystem".into(),
            storage_class: None,
        }
    }

    fn released(mut pv: PersistentVolume) -> PersistentVolume {
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Released".into()),
            ..Default::default()
        });
        pv
    }

    #[test]
    fn test_bind_and_release() {
        let volume = device_volume(RECLAIM_DELETE);
        let pv = bind_to_claim(volume.to_persistent_volume(), &scheduled_claim(), PROVISIONER_NAME);

        let claim_ref = pv.spec.as_ref().unwrap().claim_ref.clone().unwrap();
        assert_eq!(claim_ref.name.as_deref(), Some("data-0"));
        assert_eq!(claim_ref.uid.as_deref(), Some("1234"));
        let annotations = pv.metadata.annotations.clone().unwrap();
        assert_eq!(annotations[PROVISIONED_BY_ANNOTATION], PROVISIONER_NAME);
        assert_eq!(annotations[BDC_ANNOTATION], "bdc-pvc-1234");

        assert!(!is_released(&pv, PROVISIONER_NAME));
        let pv = released(pv);
        assert!(is_released(&pv, PROVISIONER_NAME));
        assert!(!is_released(&pv, "other.io/provisioner"));
    }

    #[test]
    fn test_failed_claims_parked_until_changed() {
        let failed = FailedClaims::default();
        let mut claim = scheduled_claim();
        claim.metadata.resource_version = Some("10".into());

        failed.record(&claim, &Error::NoSelectedNode);
        assert!(!failed.is_parked(&claim));

        failed.record(&claim, &Error::UnsupportedStorageType("zfs".into()));
        assert!(failed.is_parked(&claim));

        claim.metadata.resource_version = Some("11".into());
        assert!(!failed.is_parked(&claim));

        claim.metadata.resource_version = Some("10".into());
        failed.clear(&claim);
        assert!(!failed.is_parked(&claim));

        failed.record(&claim, &Error::UnsupportedStorageType("zfs".into()));
        failed.retain_listed(&[]);
        assert!(!failed.is_parked(&claim));
    }

    #[test]
    fn test_retained_volume_is_not_reclaimed() {
        let volume = device_volume(RECLAIM_RETAIN);
        let pv = released(bind_to_claim(
            volume.to_persistent_volume(),
            &scheduled_claim(),
            PROVISIONER_NAME,
        ));
        assert!(!is_released(&pv, PROVISIONER_NAME));
    }
}
