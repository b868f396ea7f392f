//! Retry with exponential backoff for fetchers, downloads and mutations.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::millis;
use crate::error::QueryError;

/// How often and how patiently a failed operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_interval: Duration,
    #[serde(with = "millis")]
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// The same policy clamped to at most one retry, for non-idempotent writes.
    pub fn for_mutation(self) -> Self {
        Self {
            max_retries: self.max_retries.min(1),
            ..self
        }
    }

    /// Delay schedule doubling from `initial_interval` up to `max_interval`.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Result of [`retry_with_backoff`] along with how many retries it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, QueryError>,
    pub retries: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// per-kind retry limit of `policy` is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let mut backoff = policy.backoff();
    let mut retries = 0;

    loop {
        match op().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(label, retries, "succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                };
            }
            Err(err) => {
                if retries >= err.retry_limit(policy.max_retries) {
                    return RetryOutcome {
                        result: Err(err),
                        retries,
                    };
                }
                let wait = backoff.next_backoff().unwrap_or(policy.max_interval);
                retries += 1;
                warn!(
                    label,
                    error = %err,
                    attempt = retries,
                    wait_ms = wait.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}
