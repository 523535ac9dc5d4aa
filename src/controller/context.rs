use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use tokio::time::Instant;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryConfig;
use crate::controller::roles::RoleCatalogConnector;
use crate::health::HealthState;
use crate::resources::secret::{KubeSecretResolver, SecretResolver};
use crate::resources::sql::PgCatalogConnector;
use crate::resources::store::{ClusterStore, KubeClusterStore};

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub secrets: Arc<dyn SecretResolver>,
    pub connector: Arc<dyn RoleCatalogConnector>,
    pub config: OperatorConfig,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failed passes per `namespace/name`
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, health_state: Option<Arc<HealthState>>) -> Self {
        let secrets: Arc<dyn SecretResolver> = Arc::new(KubeSecretResolver::new(client.clone()));
        let connector = Arc::new(PgCatalogConnector::new(
            secrets.clone(),
            config.sql_connect_timeout,
        ));
        Self {
            store: Arc::new(KubeClusterStore::new(client)),
            secrets,
            connector,
            config,
            health_state,
            failures: Arc::default(),
        }
    }

    /// Build a context around explicit collaborators
    pub fn with_collaborators(
        store: Arc<dyn ClusterStore>,
        secrets: Arc<dyn SecretResolver>,
        connector: Arc<dyn RoleCatalogConnector>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            secrets,
            connector,
            config,
            health_state: None,
            failures: Arc::default(),
        }
    }

    /// Count a failed pass, returning the number of failures before it
    pub fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut failures) = self.failures.lock() else {
            return 0;
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Per-pass context for a namespace, with a fresh deadline
    pub fn scope(&self, namespace: &str) -> ReconcileContext {
        ReconcileContext::new(self.store.clone(), namespace, self.config.reconcile_timeout)
            .with_retry(RetryConfig::with_max_attempts(self.config.conflict_retries))
    }
}

/// Everything one reconcile pass needs, passed explicitly
#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn ClusterStore>,
    pub namespace: String,
    /// Every blocking call must finish before this instant
    pub deadline: Instant,
    pub retry: RetryConfig,
}

impl ReconcileContext {
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str, timeout: Duration) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            deadline: Instant::now() + timeout,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Await `fut`, failing with `Timeout` once the deadline passes
    pub async fn bounded<T, E, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        Error: From<E>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(what.to_string())),
        }
    }
}
