//! Helper Task Executor
//!
//! Runs a short-lived privileged pod on the volume's node to create a
//! directory, apply a project quota or delete the directory. The pod only
//! sees the parent of the volume directory (mounted at `/data/`) and the
//! node's `/dev/`.
//!
//! Every launched pod is deleted once observation ends, whatever the outcome.

use super::path::{is_safe_segment, split_for_mount};
use super::quota::QuotaLimits;
use crate::config::ProvisionerConfig;
use crate::domain::ports::ClusterClientRef;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    Affinity, Container, HostPathVolumeSource, LocalObjectReference, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, Pod, PodSpec, SecurityContext, Taint, Toleration,
    Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mountpoint of the volume's parent directory inside helper pods
const DATA_MOUNT: &str = "/data/";
const DEV_MOUNT: &str = "/dev/";

// =============================================================================
// Helper Operations
// =============================================================================

/// What a helper pod does to the volume directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOperation {
    /// `mkdir -m <mode> -p`
    Init { mode: String },
    /// Project quota for the detected filesystem family
    Quota { limits: QuotaLimits },
    /// `rm -rf`
    Cleanup,
}

impl HelperOperation {
    /// Short name, used as pod name prefix
    pub fn name(&self) -> &'static str {
        match self {
            HelperOperation::Init { .. } => "init",
            HelperOperation::Quota { .. } => "quota",
            HelperOperation::Cleanup => "cleanup",
        }
    }

    /// Container command operating on `volume_dir` under the data mount
    pub fn command(&self, volume_dir: &str) -> Result<Vec<String>> {
        if !is_safe_segment(volume_dir) {
            return Err(Error::InvalidHelperOptions(format!(
                "volume directory {:?} contains unsupported characters",
                volume_dir
            )));
        }
        let target = format!("{}{}", DATA_MOUNT, volume_dir);

        let command = match self {
            HelperOperation::Init { mode } => {
                if mode.is_empty() || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
                    return Err(Error::InvalidHelperOptions(format!("invalid mode {:?}", mode)));
                }
                vec!["mkdir".into(), "-m".into(), mode.clone(), "-p".into(), target]
            }
            HelperOperation::Quota { limits } => {
                if !limits.is_well_formed() {
                    return Err(Error::InvalidHelperOptions(format!(
                        "invalid quota limits soft={:?} hard={:?}",
                        limits.soft, limits.hard
                    )));
                }
                vec!["sh".into(), "-c".into(), quota_script(&target, limits)]
            }
            HelperOperation::Cleanup => vec!["rm".into(), "-rf".into(), target],
        };
        Ok(command)
    }
}

impl fmt::Display for HelperOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Quota Script
// =============================================================================

/// Quota commands for one filesystem family, as reported by `stat -f -c %T`
struct QuotaTemplate {
    fs_name: &'static str,
    body: &'static str,
    uppercase_limits: bool,
}

/// `{dir}`, `{soft}` and `{hard}` are substituted with validated values.
/// `PID` becomes the next free project id.
const QUOTA_TEMPLATES: &[QuotaTemplate] = &[
    QuotaTemplate {
        fs_name: "xfs",
        body: "PID=`xfs_quota -x -c 'report -h' /data | tail -2 | awk 'NR==1{print substr ($1,2)}+0'` ; \
               PID=`expr $PID + 1` ; \
               xfs_quota -x -c 'project -s -p {dir} '$PID /data ; \
               xfs_quota -x -c 'limit -p bsoft={soft} bhard={hard} '$PID /data ;",
        uppercase_limits: false,
    },
    QuotaTemplate {
        fs_name: "ext2/ext3",
        body: "PID=`repquota -P /data | tail -3 | awk 'NR==1{print substr ($1,2)}+0'` ; \
               PID=`expr $PID + 1` ; \
               chattr +P -p $PID {dir} ; \
               setquota -P $PID {soft} {hard} 0 0 /data ;",
        uppercase_limits: true,
    },
];

/// Shell script applying `limits` to `target`.
///
/// Unknown filesystems remove the directory and exit non-zero, so a quota
/// request never silently yields an unlimited volume.
fn quota_script(target: &str, limits: &QuotaLimits) -> String {
    let mut script = String::from("FS=`stat -f -c %T /data` ; ");

    for (i, template) in QUOTA_TEMPLATES.iter().enumerate() {
        let (soft, hard) = if template.uppercase_limits {
            (limits.soft.to_uppercase(), limits.hard.to_uppercase())
        } else {
            (limits.soft.clone(), limits.hard.clone())
        };
        let keyword = if i == 0 { "if" } else { "elif" };
        let body = template
            .body
            .replace("{dir}", target)
            .replace("{soft}", &soft)
            .replace("{hard}", &hard);

        script.push_str(&format!(
            "{} [[ \"$FS\" == \"{}\" ]]; then {} ",
            keyword, template.fs_name, body
        ));
    }

    script.push_str(&format!("else rm -rf {} ; exit 1; fi", target));
    script
}

// =============================================================================
// Helper Task
// =============================================================================

/// One helper pod invocation
#[derive(Debug, Clone)]
pub struct HelperTask {
    pub operation: HelperOperation,
    /// PV name, used to derive the pod name
    pub volume_name: String,
    /// Absolute volume path on the node
    pub path: String,
    /// Labels pinning the pod to the volume's node
    pub node_affinity: BTreeMap<String, String>,
    /// Taints of the node, tolerated by the pod
    pub taints: Vec<Taint>,
}

impl HelperTask {
    /// Deterministic pod name, e.g. `init-pvc-1234`
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.operation.name(), self.volume_name)
    }

    fn validate(&self, config: &ProvisionerConfig) -> Result<()> {
        if self.volume_name.is_empty()
            || self.path.is_empty()
            || self.node_affinity.is_empty()
            || config.service_account.is_empty()
        {
            return Err(Error::InvalidHelperOptions(
                "invalid empty name or hostpath or hostname or service account name".to_string(),
            ));
        }
        Ok(())
    }
}

fn toleration_for(taint: &Taint) -> Toleration {
    let operator = if taint.value.is_some() { "Equal" } else { "Exists" };
    Toleration {
        key: Some(taint.key.clone()),
        operator: Some(operator.to_string()),
        value: taint.value.clone(),
        effect: Some(taint.effect.clone()),
        toleration_seconds: None,
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

fn mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(false),
        ..Default::default()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Launches helper pods and waits for them to finish
pub struct HelperTaskExecutor {
    cluster: ClusterClientRef,
    config: Arc<ProvisionerConfig>,
}

impl HelperTaskExecutor {
    pub fn new(cluster: ClusterClientRef, config: Arc<ProvisionerConfig>) -> Self {
        Self { cluster, config }
    }

    /// Build the pod for `task`
    pub fn build_pod(&self, task: &HelperTask) -> Result<Pod> {
        task.validate(&self.config)?;
        let (parent_dir, volume_dir) = split_for_mount(&task.path)?;
        let command = task.operation.command(&volume_dir)?;

        let match_expressions = task
            .node_affinity
            .iter()
            .map(|(key, value)| NodeSelectorRequirement {
                key: key.clone(),
                operator: "In".to_string(),
                values: Some(vec![value.clone()]),
            })
            .collect();

        let image_pull_secrets = if self.config.image_pull_secrets.is_empty() {
            None
        } else {
            Some(
                self.config
                    .image_pull_secrets
                    .iter()
                    .map(|s| LocalObjectReference {
                        name: Some(s.clone()),
                    })
                    .collect(),
            )
        };

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(task.pod_name()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                affinity: Some(Affinity {
                    node_affinity: Some(NodeAffinity {
                        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                            node_selector_terms: vec![NodeSelectorTerm {
                                match_expressions: Some(match_expressions),
                                match_fields: None,
                            }],
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                service_account_name: Some(self.config.service_account.clone()),
                tolerations: Some(task.taints.iter().map(toleration_for).collect()),
                containers: vec![Container {
                    name: format!("local-path-{}", task.operation.name()),
                    image: Some(self.config.helper_image.clone()),
                    command: Some(command),
                    volume_mounts: Some(vec![mount("data", DATA_MOUNT), mount("dev", DEV_MOUNT)]),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                image_pull_secrets,
                volumes: Some(vec![
                    host_path_volume("data", &parent_dir),
                    host_path_volume("dev", DEV_MOUNT),
                ]),
                host_network: self.config.helper_host_network.then_some(true),
                ..Default::default()
            }),
            status: None,
        })
    }

    /// Run `task` to completion.
    ///
    /// Returns once the pod succeeded, failed, ran out of polls or `cancel`
    /// fired. The pod is deleted before returning in all of those cases; a
    /// failed delete is logged and does not change the result.
    pub async fn run(&self, task: &HelperTask, cancel: &CancellationToken) -> Result<()> {
        let pod = self.build_pod(task)?;
        let name = task.pod_name();
        let namespace = self.config.namespace.as_str();

        info!(
            "Launching helper pod {} on node {:?} for {}",
            name, task.node_affinity, task.path
        );

        match self.cluster.create_pod(namespace, &pod).await {
            Ok(_) => {}
            Err(Error::ResourceExists { .. }) => {
                info!("Helper pod {} already exists, waiting on it", name);
            }
            Err(e) => return Err(e),
        }

        let result = self.wait(&name, cancel).await;

        if let Err(e) = self.cluster.delete_pod(namespace, &name).await {
            warn!("Unable to delete the helper pod {}: {}", name, e);
        }

        match &result {
            Ok(()) => info!("Helper pod {} completed", name),
            Err(e) => warn!("Helper pod {} did not complete: {}", name, e),
        }
        result
    }

    async fn wait(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let namespace = self.config.namespace.as_str();

        for attempt in 0..self.config.helper_poll_count {
            let pod = self.cluster.get_pod(namespace, name).await?;
            let status = pod.status.as_ref();
            let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Pending");
            debug!("Helper pod {} phase {} (poll {})", name, phase, attempt + 1);

            match phase {
                "Succeeded" => return Ok(()),
                "Failed" => {
                    let reason = status
                        .and_then(|s| s.message.clone().or_else(|| s.reason.clone()))
                        .unwrap_or_else(|| "pod failed".to_string());
                    return Err(Error::HelperFailed {
                        task: name.to_string(),
                        reason,
                    });
                }
                _ => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting on helper pod {}", name)));
                }
                _ = tokio::time::sleep(self.config.helper_poll_interval) => {}
            }
        }

        Err(Error::HelperTimeout {
            task: name.to_string(),
            polls: self.config.helper_poll_count,
        })
    }
}
