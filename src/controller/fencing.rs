//! Fencing and unfencing of cluster instances
//!
//! Both operations are read-modify-write cycles over the fencing annotation,
//! re-run from a fresh read whenever the update hits a conflict.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::controller::context::ReconcileContext;
use crate::controller::error::{Error, Result};
use crate::controller::retry::retry_on_conflict;
use crate::crd::{FENCE_ALL_INSTANCES, FENCED_INSTANCES_ANNOTATION, FencingSet, PostgresCluster};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FencingChange {
    Fence,
    Unfence,
}

impl FencingChange {
    fn as_str(self) -> &'static str {
        match self {
            FencingChange::Fence => "fence",
            FencingChange::Unfence => "unfence",
        }
    }

    /// Validate `instance` against the cluster and mutate `set`
    fn apply(self, cluster: &PostgresCluster, set: &mut FencingSet, instance: &str) -> Result<()> {
        let wildcard = instance == FENCE_ALL_INSTANCES;
        match self {
            FencingChange::Fence => {
                if !wildcard && !cluster.has_instance(instance) {
                    return Err(invalid_instance(cluster, instance));
                }
                set.fence(instance);
            }
            FencingChange::Unfence => {
                if !wildcard
                    && (set.is_all() || (!set.lists(instance) && !cluster.has_instance(instance)))
                {
                    return Err(invalid_instance(cluster, instance));
                }
                set.unfence(instance);
            }
        }
        Ok(())
    }
}

fn invalid_instance(cluster: &PostgresCluster, instance: &str) -> Error {
    Error::InvalidInstance {
        instance: instance.to_string(),
        cluster: cluster.metadata.name.clone().unwrap_or_default(),
    }
}

/// Store the set in the annotation, removing it when nothing is fenced
fn write_fencing_annotation(cluster: &mut PostgresCluster, set: &FencingSet) -> Result<()> {
    let encoded = set.to_annotation()?;
    let annotations = cluster.metadata.annotations.get_or_insert_with(BTreeMap::new);
    match encoded {
        Some(value) => {
            annotations.insert(FENCED_INSTANCES_ANNOTATION.to_string(), value);
        }
        None => {
            annotations.remove(FENCED_INSTANCES_ANNOTATION);
        }
    }
    Ok(())
}

/// Fence `instance` on the cluster, or every instance for `*`.
///
/// Fails with `InvalidInstance` when a named instance is not a member of the
/// cluster. Returns the resulting fencing set.
pub async fn fence_on(
    ctx: &ReconcileContext,
    cluster_name: &str,
    instance: &str,
) -> Result<FencingSet> {
    update_fencing(ctx, cluster_name, instance, FencingChange::Fence).await
}

/// Lift fencing from `instance`, or from every instance for `*`.
///
/// A name that left the cluster can still be unfenced while it is listed.
/// A single instance cannot be unfenced while the whole cluster is fenced.
pub async fn fence_off(
    ctx: &ReconcileContext,
    cluster_name: &str,
    instance: &str,
) -> Result<FencingSet> {
    update_fencing(ctx, cluster_name, instance, FencingChange::Unfence).await
}

async fn update_fencing(
    ctx: &ReconcileContext,
    cluster_name: &str,
    instance: &str,
    change: FencingChange,
) -> Result<FencingSet> {
    retry_on_conflict(&ctx.retry, "update fencing annotation", move || async move {
        let mut cluster = ctx
            .bounded(
                "get cluster",
                ctx.store.get_cluster(&ctx.namespace, cluster_name),
            )
            .await?;

        let current = cluster.fencing_set().map_err(|e| {
            Error::InvalidConfig(format!(
                "malformed {FENCED_INSTANCES_ANNOTATION} annotation on {cluster_name}: {e}"
            ))
        })?;

        let mut next = current.clone();
        change.apply(&cluster, &mut next, instance)?;

        if next == current {
            debug!(
                cluster = %cluster_name,
                instance = %instance,
                change = change.as_str(),
                "Fencing already in the requested state"
            );
            return Ok(next);
        }

        write_fencing_annotation(&mut cluster, &next)?;
        ctx.bounded("update cluster", ctx.store.update_cluster(&cluster))
            .await?;

        info!(
            cluster = %cluster_name,
            namespace = %ctx.namespace,
            instance = %instance,
            change = change.as_str(),
            "Updated fenced instances"
        );
        Ok(next)
    })
    .await
}

/// Number of member instances currently fenced
pub fn fenced_instance_count(cluster: &PostgresCluster) -> usize {
    let Some(status) = cluster.status.as_ref() else {
        return 0;
    };
    match cluster.fencing_set() {
        Ok(set) => status
            .instance_names
            .iter()
            .filter(|name| set.contains(name))
            .count(),
        Err(_) => 0,
    }
}
