//! Retry policies keyed by error category.
//!
//! [`RetryPolicy::for_kind`] is a pure lookup from [`ErrorKind`] to a policy;
//! there is no registry to mutate. [`retry_with_policy`] re-evaluates the
//! policy for every failure, so an operation that first hits a busy runtime
//! and then a name conflict stops retrying immediately.
//!
//! # Example
//!
//! ```ignore
//! use kina::retry::retry_with_policy;
//!
//! let node = retry_with_policy("create node demo-worker1", || {
//!     provider.create_node("demo", &plan)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::ErrorKind;
use crate::{Error, Result};

/// How (and whether) to retry a failed operation.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error
    NoRetry,
    /// Wait the same interval between attempts
    Fixed {
        /// Delay between attempts
        interval: Duration,
        /// Total attempts including the first
        max_attempts: u32,
        /// Upper bound on the summed delays
        max_total_delay: Duration,
    },
    /// Exponential backoff with jitter
    Exponential {
        /// Delay after the first failure
        initial_delay: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Cap on a single delay
        max_delay: Duration,
        /// Total attempts including the first
        max_attempts: u32,
        /// Upper bound on the summed delays
        max_total_delay: Duration,
    },
}

impl RetryPolicy {
    /// The policy for an error category.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ProviderTransient => RetryPolicy::Exponential {
                initial_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_secs(5),
                max_attempts: 5,
                max_total_delay: Duration::from_secs(30),
            },
            ErrorKind::NetworkTimeout => RetryPolicy::Fixed {
                interval: Duration::from_secs(2),
                max_attempts: 3,
                max_total_delay: Duration::from_secs(10),
            },
            ErrorKind::ImagePull => RetryPolicy::Exponential {
                initial_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
                max_total_delay: Duration::from_secs(20),
            },
            ErrorKind::Validation
            | ErrorKind::NameConflict
            | ErrorKind::NotFound
            | ErrorKind::ProviderFatal
            | ErrorKind::Exec
            | ErrorKind::Join
            | ErrorKind::BootstrapTimeout
            | ErrorKind::Cleanup
            | ErrorKind::Kubernetes
            | ErrorKind::Internal => RetryPolicy::NoRetry,
        }
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Upper bound on the summed delays
    pub fn max_total_delay(&self) -> Duration {
        match self {
            RetryPolicy::NoRetry => Duration::ZERO,
            RetryPolicy::Fixed {
                max_total_delay, ..
            }
            | RetryPolicy::Exponential {
                max_total_delay, ..
            } => *max_total_delay,
        }
    }

    /// Base delay after `failed_attempts` failures, before jitter.
    ///
    /// Returns `None` when the attempt budget is spent.
    pub fn base_delay(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts >= self.max_attempts() {
            return None;
        }
        match self {
            RetryPolicy::NoRetry => None,
            RetryPolicy::Fixed { interval, .. } => Some(*interval),
            RetryPolicy::Exponential {
                initial_delay,
                multiplier,
                max_delay,
                ..
            } => {
                let exp = multiplier.powi(failed_attempts as i32 - 1);
                Some(Duration::from_secs_f64(
                    (initial_delay.as_secs_f64() * exp).min(max_delay.as_secs_f64()),
                ))
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        match self {
            RetryPolicy::Exponential { .. } => {
                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                Duration::from_secs_f64(delay.as_secs_f64() * jitter)
            }
            _ => delay,
        }
    }
}

/// Execute an async operation, retrying according to each failure's kind.
///
/// # Arguments
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error once the policy for that
/// error's kind is exhausted (attempts or total delay).
pub async fn retry_with_policy<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut total_delay = Duration::ZERO;

    loop {
        attempt += 1;

        let err: Error = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let policy = RetryPolicy::for_kind(err.kind());
        let delay = match policy.base_delay(attempt) {
            Some(base) => policy.jittered(base),
            None => {
                if policy != RetryPolicy::NoRetry {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %err,
                        "Operation failed after max retries"
                    );
                }
                return Err(err);
            }
        };

        if total_delay + delay > policy.max_total_delay() {
            error!(
                operation = %operation_name,
                attempt = attempt,
                total_delay_ms = total_delay.as_millis(),
                error = %err,
                "Operation failed, retry delay budget exhausted"
            );
            return Err(err);
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
        total_delay += delay;
    }
}
