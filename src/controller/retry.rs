//! Conflict retry for read-modify-write updates
//!
//! Every cluster-object mutation is a conditional update. When the API server
//! reports that the object changed underneath us, the whole operation is
//! re-run from a fresh read, with exponential backoff and jitter between
//! attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::controller::error::{BackoffConfig, Error, Result};

/// Conflict retry settings
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
                multiplier: 2.0,
                jitter: 0.2,
            },
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }
}

/// Run `operation` until it stops failing with a conflict.
///
/// Errors other than conflicts are returned immediately. Once
/// `max_attempts` is exhausted the conflict is surfaced as `Error::Conflict`.
pub async fn retry_on_conflict<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Err(e) if e.is_conflict() => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Giving up after repeated update conflicts"
                    );
                    return Err(Error::Conflict(format!(
                        "{operation_name}: object kept changing after {attempt} attempts"
                    )));
                }

                let delay = config.backoff.delay_for_attempt(attempt - 1);
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Update conflict, re-reading and retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
