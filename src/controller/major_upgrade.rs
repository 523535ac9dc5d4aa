//! Major version upgrade orchestration
//!
//! A pending major upgrade is carried out by one job per attempt, run
//! against the primary's data volume. The job has two stages:
//!
//! ```text
//! prepare (old image)  ->  major-upgrade (new image)
//!   copies the old         runs pg_upgrade using the
//!   binaries aside         copied binaries
//! ```
//!
//! Attempt progress follows `NotStarted -> JobCreated -> {Succeeded | Failed}`
//! and is read from the job's own status, never computed.

use std::fmt;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::controller::context::ReconcileContext;
use crate::controller::error::{Error, Result};
use crate::crd::{MajorUpgradeStatus, PostgresCluster, UpgradePhase};
use crate::resources::common::{JOB_ROLE_LABEL, job_labels, owner_reference};

/// Job role label value, also the name of the execute-stage container
pub const MAJOR_UPGRADE_JOB_ROLE: &str = "major-upgrade";

/// Init container running the old image
pub const PREPARE_CONTAINER: &str = "prepare";

const PGDATA_VOLUME: &str = "pgdata";
const PGDATA_PATH: &str = "/var/lib/postgresql/data";
const SCRATCH_VOLUME: &str = "scratch-data";
const SCRATCH_PATH: &str = "/controller";
const SHM_VOLUME: &str = "shm";
const SHM_PATH: &str = "/dev/shm";
const MANAGER_BINARY: &str = "/controller/manager";
const DEFAULT_SECCOMP_PROFILE: &str = "RuntimeDefault";

/// Name of the upgrade job for the instance with the given serial
pub fn major_upgrade_job_name(cluster_name: &str, serial: u32) -> String {
    format!("{cluster_name}-{serial}-{MAJOR_UPGRADE_JOB_ROLE}")
}

/// Name of the data volume claim of an instance
pub fn instance_pvc_name(cluster_name: &str, serial: u32) -> String {
    format!("{cluster_name}-{serial}")
}

fn volume_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: PGDATA_VOLUME.to_string(),
            mount_path: PGDATA_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: SCRATCH_VOLUME.to_string(),
            mount_path: SCRATCH_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: SHM_VOLUME.to_string(),
            mount_path: SHM_PATH.to_string(),
            ..Default::default()
        },
    ]
}

fn volumes(cluster_name: &str, serial: u32) -> Vec<Volume> {
    vec![
        Volume {
            name: PGDATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: instance_pvc_name(cluster_name, serial),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        Volume {
            name: SCRATCH_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: SHM_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Restricted container security context
fn container_security_context(cluster: &PostgresCluster) -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        privileged: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: cluster
                .spec
                .seccomp_profile
                .clone()
                .unwrap_or_else(|| DEFAULT_SECCOMP_PROFILE.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stage_container(cluster: &PostgresCluster, name: &str, image: &str, args: &[&str]) -> Container {
    let command = std::iter::once(MANAGER_BINARY)
        .chain(["instance", "upgrade"])
        .chain(args.iter().copied())
        .map(String::from)
        .collect();

    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        command: Some(command),
        volume_mounts: Some(volume_mounts()),
        resources: cluster.spec.resources.as_ref().map(Into::into),
        security_context: Some(container_security_context(cluster)),
        ..Default::default()
    }
}

/// Build the upgrade job for the instance with the given serial.
///
/// Fails when the cluster has no pending major upgrade, so a job is either
/// fully specified or not built at all.
pub fn create_major_upgrade_job(cluster: &PostgresCluster, serial: u32) -> Result<Job> {
    let old_image = cluster.pending_major_upgrade().ok_or_else(|| {
        Error::InvalidConfig(format!(
            "cluster {} has no pending major upgrade",
            cluster.name_any()
        ))
    })?;
    let cluster_name = cluster
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let labels = job_labels(cluster_name, MAJOR_UPGRADE_JOB_ROLE);

    let prepare = stage_container(
        cluster,
        PREPARE_CONTAINER,
        old_image,
        &["prepare", "/controller/old"],
    );
    let execute = stage_container(
        cluster,
        MAJOR_UPGRADE_JOB_ROLE,
        &cluster.spec.image_name,
        &["execute", "/controller/old/bindir.txt"],
    );

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(major_upgrade_job_name(cluster_name, serial)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![prepare]),
                    containers: vec![execute],
                    volumes: Some(volumes(cluster_name, serial)),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Whether the job is a major upgrade job, judged by its role label
pub fn is_major_upgrade_job(job: &Job) -> bool {
    job.labels()
        .get(JOB_ROLE_LABEL)
        .is_some_and(|role| role == MAJOR_UPGRADE_JOB_ROLE)
}

/// Image of the execute stage of a major upgrade job
pub fn get_target_image_from_major_upgrade_job(job: &Job) -> Option<&str> {
    if !is_major_upgrade_job(job) {
        return None;
    }
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == MAJOR_UPGRADE_JOB_ROLE)?
        .image
        .as_deref()
}

/// Phase of the attempt as reported by the job
pub fn job_phase(job: &Job) -> UpgradePhase {
    let Some(status) = job.status.as_ref() else {
        return UpgradePhase::JobCreated;
    };

    let condition_true = |type_: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    if condition_true("Complete") || status.succeeded.unwrap_or(0) > 0 {
        UpgradePhase::Succeeded
    } else if condition_true("Failed") || status.failed.unwrap_or(0) > 0 {
        UpgradePhase::Failed
    } else {
        UpgradePhase::JobCreated
    }
}

/// Events moving an upgrade attempt forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeEvent {
    /// The job exists, created by this pass or an earlier one
    JobCreated,
    /// The job completed
    JobSucceeded,
    /// The job failed
    JobFailed,
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeEvent::JobCreated => write!(f, "JobCreated"),
            UpgradeEvent::JobSucceeded => write!(f, "JobSucceeded"),
            UpgradeEvent::JobFailed => write!(f, "JobFailed"),
        }
    }
}

/// A state transition definition for upgrade phases
#[derive(Debug)]
pub struct UpgradeTransition {
    pub from: UpgradePhase,
    pub to: UpgradePhase,
    pub event: UpgradeEvent,
    pub description: &'static str,
}

impl UpgradeTransition {
    const fn new(
        from: UpgradePhase,
        to: UpgradePhase,
        event: UpgradeEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting an upgrade state transition
#[derive(Debug, PartialEq, Eq)]
pub enum UpgradeTransitionResult {
    Success {
        from: UpgradePhase,
        to: UpgradePhase,
        event: UpgradeEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: UpgradePhase,
        event: UpgradeEvent,
    },
}

/// State machine for one major upgrade attempt
pub struct UpgradeStateMachine {
    transitions: Vec<UpgradeTransition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                UpgradeTransition::new(
                    UpgradePhase::NotStarted,
                    UpgradePhase::JobCreated,
                    UpgradeEvent::JobCreated,
                    "Upgrade job created",
                ),
                UpgradeTransition::new(
                    UpgradePhase::JobCreated,
                    UpgradePhase::Succeeded,
                    UpgradeEvent::JobSucceeded,
                    "Upgrade job completed",
                ),
                UpgradeTransition::new(
                    UpgradePhase::JobCreated,
                    UpgradePhase::Failed,
                    UpgradeEvent::JobFailed,
                    "Upgrade job failed",
                ),
                // Succeeded and Failed are terminal for the attempt
            ],
        }
    }

    pub fn transition(&self, current: UpgradePhase, event: UpgradeEvent) -> UpgradeTransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => UpgradeTransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
            None => UpgradeTransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: UpgradePhase, event: UpgradeEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Apply `event`, staying in place when the transition is not allowed
    pub fn advance(&self, cluster: &str, current: UpgradePhase, event: UpgradeEvent) -> UpgradePhase {
        match self.transition(current, event) {
            UpgradeTransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(
                    cluster = %cluster,
                    from = %from,
                    to = %to,
                    "{}", description
                );
                to
            }
            UpgradeTransitionResult::InvalidTransition { current, event } => {
                warn!(
                    cluster = %cluster,
                    phase = %current,
                    event = %event,
                    "Ignoring invalid upgrade transition"
                );
                current
            }
        }
    }
}

/// Result of one upgrade step
#[derive(Debug, Default, PartialEq)]
pub struct UpgradeOutcome {
    /// Attempt record to store in the status; `None` clears it
    pub status: Option<MajorUpgradeStatus>,
    /// Whether this pass created the job
    pub job_created: bool,
    /// Whether the upgrade completed and the source image can be cleared
    pub completed: bool,
    /// A running job targets another image than the spec
    pub superseded: bool,
}

/// Settle the last attempt once no upgrade is pending.
///
/// The recorded job is deleted when it has finished. A job still running
/// keeps its record so the cluster stays in the upgrading phase.
async fn clean_up_attempt(
    ctx: &ReconcileContext,
    cluster_name: &str,
    recorded: Option<MajorUpgradeStatus>,
) -> Result<UpgradeOutcome> {
    let Some(record) = recorded else {
        return Ok(UpgradeOutcome::default());
    };
    let Some(job_name) = record.job_name.clone() else {
        return Ok(UpgradeOutcome::default());
    };

    let jobs = ctx
        .bounded("list jobs", ctx.store.list_jobs(&ctx.namespace, cluster_name))
        .await?;
    let Some(job) = jobs
        .iter()
        .find(|job| is_major_upgrade_job(job) && job.name_any() == job_name)
    else {
        return Ok(UpgradeOutcome::default());
    };

    if job_phase(job) == UpgradePhase::JobCreated {
        warn!(
            cluster = %cluster_name,
            job = %job_name,
            "Upgrade job still running without a pending upgrade, leaving it"
        );
        return Ok(UpgradeOutcome {
            status: Some(MajorUpgradeStatus {
                phase: UpgradePhase::JobCreated,
                ..record
            }),
            ..Default::default()
        });
    }

    ctx.bounded(
        "delete upgrade job",
        ctx.store.delete_job(&ctx.namespace, &job_name),
    )
    .await?;
    info!(cluster = %cluster_name, job = %job_name, "Removed finished upgrade job");
    Ok(UpgradeOutcome::default())
}

/// Drive the major upgrade of a cluster one step forward.
///
/// With no pending upgrade, the job of a finished attempt is removed and the
/// attempt record cleared. Otherwise the attempt's job is looked up by label
/// and created when missing. A job targeting another image is replaced only
/// once it has finished; a running job is never interrupted.
pub async fn reconcile_major_upgrade(
    ctx: &ReconcileContext,
    cluster: &PostgresCluster,
) -> Result<UpgradeOutcome> {
    let cluster_name = cluster.name_any();
    let recorded = cluster
        .status
        .as_ref()
        .and_then(|s| s.major_upgrade.clone());

    if cluster.pending_major_upgrade().is_none() {
        return clean_up_attempt(ctx, &cluster_name, recorded).await;
    }

    let machine = UpgradeStateMachine::new();
    let target_image = cluster.spec.image_name.as_str();
    let mut phase = recorded.as_ref().map(|r| r.phase).unwrap_or_default();

    let jobs = ctx
        .bounded(
            "list jobs",
            ctx.store.list_jobs(&ctx.namespace, &cluster_name),
        )
        .await?;
    let mut existing = jobs.into_iter().find(is_major_upgrade_job);

    if let Some(job) = &existing
        && get_target_image_from_major_upgrade_job(job) != Some(target_image)
    {
        let stale = job.name_any();
        let running_target = get_target_image_from_major_upgrade_job(job).map(String::from);
        if job_phase(job) == UpgradePhase::JobCreated {
            warn!(
                cluster = %cluster_name,
                job = %stale,
                running_target = ?running_target,
                target_image = %target_image,
                "Upgrade job for another image is still running, waiting for it"
            );
            return Ok(UpgradeOutcome {
                status: Some(MajorUpgradeStatus {
                    phase: UpgradePhase::JobCreated,
                    job_name: Some(stale),
                    target_image: running_target,
                }),
                superseded: true,
                ..Default::default()
            });
        }
        warn!(
            cluster = %cluster_name,
            job = %stale,
            target_image = %target_image,
            "Finished upgrade job targets another image, replacing it"
        );
        ctx.bounded(
            "delete upgrade job",
            ctx.store.delete_job(&ctx.namespace, &stale),
        )
        .await?;
        existing = None;
    }

    let mut job_created = false;
    let job = match existing {
        Some(job) => job,
        None => {
            let Some(serial) = cluster
                .current_primary()
                .and_then(|primary| cluster.instance_serial(primary))
            else {
                info!(cluster = %cluster_name, "Waiting for a primary before upgrading");
                return Ok(UpgradeOutcome {
                    status: Some(MajorUpgradeStatus {
                        phase: UpgradePhase::NotStarted,
                        job_name: None,
                        target_image: Some(target_image.to_string()),
                    }),
                    ..Default::default()
                });
            };

            // A new job always starts a new attempt
            phase = UpgradePhase::NotStarted;
            let job = create_major_upgrade_job(cluster, serial)?;
            match ctx
                .bounded("create upgrade job", ctx.store.create_job(&job))
                .await
            {
                Ok(created) => {
                    job_created = true;
                    info!(cluster = %cluster_name, job = %created.name_any(), "Created upgrade job");
                    created
                }
                Err(Error::AlreadyExists(_)) => job,
                Err(e) => return Err(e),
            }
        }
    };

    if phase == UpgradePhase::NotStarted {
        phase = machine.advance(&cluster_name, phase, UpgradeEvent::JobCreated);
    }
    match job_phase(&job) {
        UpgradePhase::Succeeded => {
            phase = machine.advance(&cluster_name, phase, UpgradeEvent::JobSucceeded);
        }
        UpgradePhase::Failed => {
            phase = machine.advance(&cluster_name, phase, UpgradeEvent::JobFailed);
        }
        UpgradePhase::NotStarted | UpgradePhase::JobCreated => {}
    }

    Ok(UpgradeOutcome {
        status: Some(MajorUpgradeStatus {
            phase,
            job_name: Some(job.name_any()),
            target_image: Some(target_image.to_string()),
        }),
        job_created,
        completed: phase == UpgradePhase::Succeeded,
        superseded: false,
    })
}
