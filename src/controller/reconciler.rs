//! Reconciliation logic for PostgresCluster resources
//!
//! One pass runs the independent steps in order: managed roles, then the
//! major upgrade, then a single status write summarizing both. Deletion
//! releases the dependents' finalizers before the cluster's own.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::{Context, ReconcileContext};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::fencing::fenced_instance_count;
use crate::controller::finalizers::delete_dependent_finalizers;
use crate::controller::major_upgrade::{UpgradeOutcome, reconcile_major_upgrade};
use crate::controller::retry::retry_on_conflict;
use crate::controller::roles::{RoleOperation, RoleSyncPolicy, RoleSyncReport, sync_roles};
use crate::controller::status::{StatusManager, apply_phase};
use crate::crd::{ClusterPhase, ManagedRolesStatus, PostgresCluster, UpgradePhase};

/// Finalizer held by the operator on every PostgresCluster
pub const CLUSTER_FINALIZER: &str = "pgcluster.io/cluster-finalizer";

/// Requeue interval while an upgrade job runs
const UPGRADE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default backoff configuration for error handling
fn default_backoff() -> BackoffConfig {
    BackoffConfig::default()
}

fn object_key(cluster: &PostgresCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.name_any();
    let rctx = ctx.scope(&ns);

    info!("Reconciling PostgresCluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &rctx).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&rctx, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_cluster(&cluster, &ctx, &rctx).await;

    if let Some(state) = &ctx.health_state {
        match &result {
            Ok(_) => {
                state
                    .metrics
                    .record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
                state
                    .last_reconcile
                    .store(chrono::Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
            }
            Err(_) => state.metrics.record_error(&ns, &name),
        }
    }

    match result {
        Ok(action) => {
            ctx.reset_failures(&object_key(&cluster));
            info!("Reconciliation completed successfully");
            Ok(action)
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            let generation = cluster.metadata.generation;
            let reason = e.reason();
            let message = e.to_string();
            // Status is best effort here; the reconcile error is what gets requeued
            if let Err(status_err) = StatusManager::new(&rctx, &cluster)
                .update(|status| {
                    apply_phase(status, generation, ClusterPhase::Failed, reason, &message)
                })
                .await
            {
                warn!(error = %status_err, "Failed to record failure in status");
            }
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let attempt = ctx.record_failure(&object_key(&cluster));
    let delay = default_backoff().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            name = %name,
            attempt,
            error = %error,
            "Retryable error, requeuing in {:?}",
            delay
        );
    } else {
        error!(
            name = %name,
            error = %error,
            "Non-retryable error, requeuing in {:?} for manual intervention",
            delay
        );
    }

    Action::requeue(delay)
}

async fn reconcile_cluster(
    cluster: &PostgresCluster,
    ctx: &Context,
    rctx: &ReconcileContext,
) -> Result<Action> {
    let ns = rctx.namespace.as_str();
    let name = cluster.name_any();

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .set_fenced_instances(ns, &name, fenced_instance_count(cluster) as i64);
    }

    let roles = sync_managed_roles(cluster, ctx, rctx).await?;

    let upgrade = reconcile_major_upgrade(rctx, cluster).await?;
    if upgrade.job_created
        && let Some(state) = &ctx.health_state
    {
        state.metrics.record_upgrade_job_created(ns, &name);
    }

    let role_error = roles.as_ref().and_then(RoleSyncReport::partial_failure);
    let (phase, reason, message) = summarize(role_error.as_ref(), &upgrade);
    let generation = cluster.metadata.generation;
    let clear_roles = cluster.managed_roles().is_empty();

    StatusManager::new(rctx, cluster)
        .update(|status| {
            if let Some(report) = &roles {
                status.managed_roles_status = Some(managed_roles_status(report));
            } else if clear_roles {
                status.managed_roles_status = None;
            }
            status.major_upgrade = upgrade.status.clone();
            if upgrade.completed {
                status.major_version_upgrade_from_image = None;
            }
            apply_phase(status, generation, phase, reason, &message);
        })
        .await?;

    if let Some(e) = role_error {
        return Err(e);
    }

    if phase == ClusterPhase::UpgradingMajorVersion {
        return Ok(Action::requeue(UPGRADE_POLL_INTERVAL));
    }
    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Phase, reason and message describing the outcome of a pass
fn summarize(
    role_error: Option<&Error>,
    upgrade: &UpgradeOutcome,
) -> (ClusterPhase, &'static str, String) {
    let upgrade_phase = upgrade.status.as_ref().map(|s| s.phase);

    if let Some(e) = role_error {
        return (ClusterPhase::Failed, e.reason(), e.to_string());
    }
    match upgrade_phase {
        Some(UpgradePhase::Failed) => (
            ClusterPhase::Failed,
            "MajorUpgradeFailed",
            "Major upgrade job failed".to_string(),
        ),
        Some(UpgradePhase::NotStarted | UpgradePhase::JobCreated) if upgrade.superseded => (
            ClusterPhase::UpgradingMajorVersion,
            "MajorUpgradeInProgress",
            "Major version upgrade in progress for a previous image; \
             the new image is applied once the running job finishes"
                .to_string(),
        ),
        Some(UpgradePhase::NotStarted | UpgradePhase::JobCreated) => (
            ClusterPhase::UpgradingMajorVersion,
            "MajorUpgradeInProgress",
            "Major version upgrade in progress".to_string(),
        ),
        Some(UpgradePhase::Succeeded) | None => (
            ClusterPhase::Running,
            "ClusterReady",
            "Cluster is reconciled".to_string(),
        ),
    }
}

fn managed_roles_status(report: &RoleSyncReport) -> ManagedRolesStatus {
    ManagedRolesStatus {
        reconciled: report.reconciled.clone(),
        not_managed: report.unmanaged.clone(),
        cannot_reconcile: report.failures_by_role(),
        password_status: report.password_states.clone(),
    }
}

/// Run the role engine against the primary, when there is one to talk to
async fn sync_managed_roles(
    cluster: &PostgresCluster,
    ctx: &Context,
    rctx: &ReconcileContext,
) -> Result<Option<RoleSyncReport>> {
    let desired = cluster.managed_roles();
    if desired.is_empty() {
        return Ok(None);
    }
    if cluster.pending_major_upgrade().is_some() || cluster.has_running_upgrade_job() {
        debug!("Major upgrade pending, skipping role synchronization");
        return Ok(None);
    }
    if cluster.current_primary().is_none() {
        debug!("No primary yet, skipping role synchronization");
        return Ok(None);
    }

    let stored = cluster
        .status
        .as_ref()
        .and_then(|s| s.managed_roles_status.as_ref())
        .map(|m| m.password_status.clone())
        .unwrap_or_default();
    let policy = RoleSyncPolicy {
        drop_unmanaged: ctx.config.drop_unmanaged_roles,
    };

    let catalog = rctx
        .bounded("connect to primary", ctx.connector.connect(cluster))
        .await?;
    let report = sync_roles(
        rctx,
        catalog.as_ref(),
        ctx.secrets.as_ref(),
        desired,
        &stored,
        policy,
    )
    .await?;
    drop(catalog);

    if let Some(state) = &ctx.health_state {
        let metrics = &state.metrics;
        metrics.record_role_operations(RoleOperation::Create.as_str(), report.created.len() as u64);
        metrics.record_role_operations(RoleOperation::Alter.as_str(), report.altered.len() as u64);
        metrics.record_role_operations(RoleOperation::Drop.as_str(), report.dropped.len() as u64);
        metrics.record_role_operations(
            RoleOperation::Password.as_str(),
            report.passwords_rotated.len() as u64,
        );
        metrics.record_role_failures(
            &rctx.namespace,
            &cluster.name_any(),
            report.failures.len() as u64,
        );
    }

    if report.wrote() {
        info!(
            created = report.created.len(),
            altered = report.altered.len(),
            dropped = report.dropped.len(),
            passwords = report.passwords_rotated.len(),
            failures = report.failures.len(),
            "Synchronized managed roles"
        );
    }
    Ok(Some(report))
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &PostgresCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == CLUSTER_FINALIZER))
}

/// Add the finalizer to the resource
async fn add_finalizer(rctx: &ReconcileContext, name: &str) -> Result<()> {
    retry_on_conflict(&rctx.retry, "add cluster finalizer", move || async move {
        let mut cluster = rctx
            .bounded("get cluster", rctx.store.get_cluster(&rctx.namespace, name))
            .await?;
        if has_finalizer(&cluster) {
            return Ok(());
        }
        cluster
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CLUSTER_FINALIZER.to_string());
        rctx.bounded("update cluster", rctx.store.update_cluster(&cluster))
            .await?;
        info!(name = %name, "Added finalizer");
        Ok(())
    })
    .await
}

async fn remove_finalizer(rctx: &ReconcileContext, name: &str) -> Result<()> {
    let outcome = retry_on_conflict(&rctx.retry, "remove cluster finalizer", move || async move {
        let mut cluster = rctx
            .bounded("get cluster", rctx.store.get_cluster(&rctx.namespace, name))
            .await?;
        let Some(finalizers) = cluster.metadata.finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != CLUSTER_FINALIZER);
        if finalizers.len() == before {
            return Ok(());
        }
        rctx.bounded("update cluster", rctx.store.update_cluster(&cluster))
            .await?;
        info!(name = %name, "Removed finalizer");
        Ok(())
    })
    .await;

    match outcome {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Handle deletion of the PostgresCluster
async fn handle_deletion(
    cluster: &PostgresCluster,
    ctx: &Context,
    rctx: &ReconcileContext,
) -> Result<Action> {
    let name = cluster.name_any();
    info!(name = %name, "Handling deletion");

    // Dependents are released even without our finalizer
    if !has_finalizer(cluster) {
        delete_dependent_finalizers(rctx, &name).await?;
        return Ok(Action::await_change());
    }

    let generation = cluster.metadata.generation;
    if let Err(e) = StatusManager::new(rctx, cluster)
        .update(|status| {
            apply_phase(
                status,
                generation,
                ClusterPhase::Deleting,
                "Deleting",
                "Releasing dependent resources",
            )
        })
        .await
    {
        debug!(error = %e, "Could not record Deleting phase");
    }

    delete_dependent_finalizers(rctx, &name).await?;
    remove_finalizer(rctx, &name).await?;

    if let Some(state) = &ctx.health_state {
        state.metrics.remove_cluster(&rctx.namespace, &name);
    }
    Ok(Action::await_change())
}
