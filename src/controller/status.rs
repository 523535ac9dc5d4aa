//! Status and conditions management for PostgresCluster resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and writing the status subresource.

use chrono::Utc;
use kube::ResourceExt;

use crate::controller::context::ReconcileContext;
use crate::controller::error::Result;
use crate::controller::retry::retry_on_conflict;
use crate::crd::{ClusterPhase, Condition, PostgresCluster, PostgresClusterStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is reconciled and in sync with its spec
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Cluster is in a degraded state but still functional
    pub const DEGRADED: &str = "Degraded";
    /// Every managed role matches its configuration
    pub const ROLES_RECONCILED: &str = "ManagedRolesReconciled";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn status_str(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Drop a condition that no longer applies
    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, status_str(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            status_str(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            status_str(is_degraded),
            reason,
            message,
        )
    }

    pub fn roles_reconciled(self, reconciled: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::ROLES_RECONCILED,
            status_str(reconciled),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Set the phase of `status` together with the matching conditions.
///
/// `reason` and `message` describe the phase; for `Failed` they carry the
/// error.
pub fn apply_phase(
    status: &mut PostgresClusterStatus,
    generation: Option<i64>,
    phase: ClusterPhase,
    reason: &str,
    message: &str,
) {
    let builder = ConditionBuilder::from_existing(std::mem::take(&mut status.conditions), generation);
    let builder = match phase {
        ClusterPhase::Running => builder
            .ready(true, reason, message)
            .progressing(false, "Stable", "Cluster is stable")
            .degraded(false, "Healthy", "Cluster is healthy"),
        ClusterPhase::UpgradingMajorVersion => builder
            .ready(false, reason, message)
            .progressing(true, reason, message)
            .degraded(false, "Healthy", "Cluster is upgrading normally"),
        ClusterPhase::Failed => builder
            .ready(false, reason, message)
            .progressing(false, "Failed", message)
            .degraded(true, reason, message),
        ClusterPhase::Deleting => builder
            .ready(false, "Deleting", "Cluster is being deleted")
            .progressing(true, "Terminating", message),
        ClusterPhase::Pending => builder
            .ready(false, reason, message)
            .progressing(true, reason, message),
    };

    status.phase = phase;
    status.observed_generation = generation;
    status.conditions = builder.build();
}

/// Status writer for one PostgresCluster
pub struct StatusManager<'a> {
    ctx: &'a ReconcileContext,
    cluster: &'a PostgresCluster,
}

impl<'a> StatusManager<'a> {
    pub fn new(ctx: &'a ReconcileContext, cluster: &'a PostgresCluster) -> Self {
        Self { ctx, cluster }
    }

    /// Apply `mutate` to the current status and write it back.
    ///
    /// On a conflict the cluster is re-read and `mutate` applied again. No
    /// write happens when `mutate` leaves the status unchanged.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: Fn(&mut PostgresClusterStatus),
    {
        let ctx = self.ctx;
        let name = self.cluster.name_any();
        let name = name.as_str();
        let mutate = &mutate;
        let mut cached = Some(self.cluster.clone());

        retry_on_conflict(&ctx.retry, "update cluster status", move || {
            let cached = cached.take();
            async move {
                let mut cluster = match cached {
                    Some(cluster) => cluster,
                    None => {
                        ctx.bounded("get cluster", ctx.store.get_cluster(&ctx.namespace, name))
                            .await?
                    }
                };

                let mut status = cluster.status.clone().unwrap_or_default();
                mutate(&mut status);
                if cluster.status.as_ref() == Some(&status) {
                    return Ok(());
                }

                cluster.status = Some(status);
                ctx.bounded(
                    "update cluster status",
                    ctx.store.update_cluster_status(&cluster),
                )
                .await?;
                Ok(())
            }
        })
        .await
    }
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &PostgresCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // Never observed, needs reconciliation
        _ => true,               // No generation, always reconcile
    }
}
