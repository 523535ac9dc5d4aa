//! Command line and runtime configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Default address of the health and metrics server
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Parser, Debug)]
#[command(name = "pgcluster-operator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller and the health server
    Run(RunArgs),
    /// Fence or unfence cluster instances
    #[command(subcommand)]
    Fence(FenceCommand),
}

#[derive(Subcommand, Debug)]
pub enum FenceCommand {
    /// Fence an instance, or every instance with `*`
    On(FenceArgs),
    /// Lift fencing from an instance, or from every instance with `*`
    Off(FenceArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FenceArgs {
    /// Cluster name
    pub cluster: String,

    /// Instance name, or `*` for all instances
    pub instance: String,

    #[arg(short, long, env = "POD_NAMESPACE", default_value = "default")]
    pub namespace: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "PGCO_NAMESPACE")]
    pub namespace: Option<String>,

    /// Deadline for one reconcile pass, in seconds
    #[arg(long, env = "PGCO_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    pub reconcile_timeout_secs: u64,

    /// Attempts for an update that hits a resource version conflict
    #[arg(long, env = "PGCO_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Drop roles that exist in the database but are not declared
    #[arg(long, env = "PGCO_DROP_UNMANAGED_ROLES", default_value_t = false)]
    pub drop_unmanaged_roles: bool,

    #[arg(long, env = "PGCO_HEALTH_ADDR", default_value = DEFAULT_HEALTH_ADDR)]
    pub health_addr: SocketAddr,

    /// Requeue interval after a successful pass, in seconds
    #[arg(long, env = "PGCO_REQUEUE_INTERVAL_SECS", default_value_t = 300)]
    pub requeue_interval_secs: u64,

    /// Timeout for opening a connection to a primary, in seconds
    #[arg(long, env = "PGCO_SQL_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub sql_connect_timeout_secs: u64,

    /// Clusters reconciled concurrently
    #[arg(long, env = "PGCO_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,
}

/// Settings shared by every reconcile pass
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub namespace: Option<String>,
    pub reconcile_timeout: Duration,
    pub conflict_retries: u32,
    pub drop_unmanaged_roles: bool,
    pub health_addr: SocketAddr,
    pub requeue_interval: Duration,
    pub sql_connect_timeout: Duration,
    pub concurrency: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            reconcile_timeout: Duration::from_secs(60),
            conflict_retries: 5,
            drop_unmanaged_roles: false,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            requeue_interval: Duration::from_secs(300),
            sql_connect_timeout: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

impl From<RunArgs> for OperatorConfig {
    fn from(args: RunArgs) -> Self {
        Self {
            namespace: args.namespace.filter(|ns| !ns.is_empty()),
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            conflict_retries: args.conflict_retries.max(1),
            drop_unmanaged_roles: args.drop_unmanaged_roles,
            health_addr: args.health_addr,
            requeue_interval: Duration::from_secs(args.requeue_interval_secs),
            sql_connect_timeout: Duration::from_secs(args.sql_connect_timeout_secs),
            concurrency: args.concurrency,
        }
    }
}
