//! Error types for the PostgresCluster controller

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::resources::secret::SecretError;
use crate::resources::sql::SqlError;

/// One role operation that failed during a synchronization pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleFailure {
    pub role: String,
    pub operation: String,
    pub message: String,
}

impl fmt::Display for RoleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.role, self.operation, self.message)
    }
}

fn join_failures(failures: &[RoleFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error variants wrapping collaborator failures keep the `Error` suffix
/// (e.g., `KubeError`, `SerializationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("{instance} is not a known instance of cluster {cluster}")]
    InvalidInstance { instance: String, cluster: String },

    #[error(
        "cannot reconcile: password both provided and disabled: role {role}, secret {secret}"
    )]
    ConfigurationConflict { role: String, secret: String },

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("{} role operation(s) failed: {}", .0.len(), join_failures(.0))]
    PartialFailure(Vec<RoleFailure>),

    #[error("Deadline exceeded while waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl Error {
    /// Whether this is an optimistic-concurrency collision
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => {
                api_err.code == 409 && api_err.reason != "AlreadyExists"
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::Secret(SecretError::NotFound(_)) => true,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            // Surfaced to the user; the next trigger re-evaluates
            Error::InvalidInstance { .. } => false,
            Error::ConfigurationConflict { .. } => false,
            Error::InvalidConfig(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::AlreadyExists(_) => false,
            Error::NotFound(_) => true, // Resource might appear later
            Error::Conflict(_) => true,
            Error::PartialFailure(_) => true,
            Error::Timeout(_) => true,
            Error::Sql(_) => true,
            Error::Secret(e) => !matches!(e, SecretError::UsernameMismatch { .. }),
        }
    }

    /// Short reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesApiError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidConfig(_) => "InvalidConfiguration",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::InvalidInstance { .. } => "InvalidInstance",
            Error::ConfigurationConflict { .. } => "ConfigurationConflict",
            Error::Conflict(_) => "Conflict",
            Error::PartialFailure(_) => "RoleSyncPartialFailure",
            Error::Timeout(_) => "Timeout",
            Error::Sql(_) => "SqlError",
            Error::Secret(_) => "SecretError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for manual intervention
            self.max_delay
        }
    }
}
