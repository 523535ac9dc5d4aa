use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};

use pgcluster_operator::config::{Cli, Command, FenceArgs, FenceCommand, OperatorConfig};
use pgcluster_operator::controller::{ReconcileContext, fence_off, fence_on};
use pgcluster_operator::health::{HealthState, run_health_server};
use pgcluster_operator::resources::store::KubeClusterStore;
use pgcluster_operator::{FencingSet, run_controller};

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

/// Deadline for a fence command
const FENCE_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgcluster_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Create Kubernetes client
    let client = Client::try_default().await?;

    match cli.command {
        Command::Run(args) => run(client, args.into()).await,
        Command::Fence(FenceCommand::On(args)) => fence(client, args, true).await,
        Command::Fence(FenceCommand::Off(args)) => fence(client, args, false).await,
    }
}

async fn run(client: Client, config: OperatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting pgcluster-operator");

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    // Start health server immediately
    let health_handle = {
        let health_state = health_state.clone();
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    info!("Watching PostgresCluster resources (apiVersion: pgcluster.io/v1)");

    let controller_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            run_controller(client, config, Some(health_state)).await;
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Cluster controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

async fn fence(client: Client, args: FenceArgs, on: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = ReconcileContext::new(
        Arc::new(KubeClusterStore::new(client)),
        &args.namespace,
        Duration::from_secs(FENCE_TIMEOUT_SECS),
    );

    let fenced = if on {
        fence_on(&ctx, &args.cluster, &args.instance).await?
    } else {
        fence_off(&ctx, &args.cluster, &args.instance).await?
    };

    match fenced {
        FencingSet::All => println!("{}: all instances fenced", args.cluster),
        FencingSet::Instances(names) if names.is_empty() => {
            println!("{}: no instances fenced", args.cluster)
        }
        FencingSet::Instances(names) => println!(
            "{}: fenced instances: {}",
            args.cluster,
            names.into_iter().collect::<Vec<_>>().join(", ")
        ),
    }
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
