pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::{Cli, Command, FenceArgs, FenceCommand, OperatorConfig, RunArgs};
pub use controller::{
    BackoffConfig, CLUSTER_FINALIZER, Context, Error, ReconcileContext, Result, error_policy,
    fence_off, fence_on, reconcile,
};
pub use crd::{FencingSet, PostgresCluster, PostgresDatabase};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the PostgresCluster controller.
///
/// Watches clusters and their upgrade jobs, in `config.namespace` or
/// cluster-wide when unset. If health_state is provided, metrics are
/// recorded for every pass.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.namespace.clone();
    let scope_msg = namespace.as_deref().unwrap_or("cluster-wide");
    tracing::info!(
        scope = %scope_msg,
        concurrency = config.concurrency,
        "Starting controller for PostgresCluster resources"
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let controller_config = ControllerConfig::default().concurrency(config.concurrency);
    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace.as_deref());
    let jobs: Api<Job> = scoped_api(client, namespace.as_deref());

    // Use any_semantic() for more reliable resource discovery
    let watcher_config = WatcherConfig::default().any_semantic();

    // Job status changes drive the upgrade state machine
    Controller::new(clusters, watcher_config.clone())
        .owns(jobs, watcher_config)
        .with_config(controller_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!(name = %obj.name, "Reconciled");
                }
                Err(e) => {
                    // Watch events for an object that was just deleted end up here
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
