//! Fixed-interval retry bounded by a deadline.
//!
//! Every remote call the state reconciler makes goes through
//! [`retry_until`]: the operation is attempted, and on failure attempted again
//! after `interval`, until it succeeds, the deadline passes, or the supplied
//! [`CancellationToken`] fires. The whole loop is a single future, so dropping
//! or cancelling it stops the retries.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval between attempts used by the state reconciler.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between a failed attempt and the next one
    pub interval: Duration,
    /// Overall budget, measured from the first attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Policy with the default 5 second interval.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL, timeout)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
        last_error: Option<String>,
    },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
}

/// Retries `operation` every `policy.interval` until it succeeds or
/// `policy.timeout` elapses.
pub async fn retry_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let deadline = Instant::now() + policy.timeout;
    retry_until_deadline(policy.interval, deadline, operation_name, cancel, operation).await
}

/// Like [`retry_until`] but against an absolute deadline, so several calls can
/// share one budget.
pub async fn retry_until_deadline<F, Fut, T, E>(
    interval: Duration,
    deadline: Instant,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut last_error: Option<String> = None;

    let attempts = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    debug!(operation = %operation_name, attempt, "Operation succeeded");
                    return Some(value);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    // The next attempt must start strictly before the deadline.
                    if Instant::now() + interval >= deadline {
                        warn!(
                            operation = %operation_name,
                            attempt,
                            error = %e,
                            "Operation failed, no time left for another attempt"
                        );
                        tokio::time::sleep_until(deadline).await;
                        return None;
                    }
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed, retrying in {:?}",
                        interval
                    );
                    tokio::time::sleep(interval).await;
                }
            }
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout_at(deadline, attempts) => Some(result.ok().flatten()),
    };

    match outcome {
        Some(Some(value)) => Ok(value),
        Some(None) => {
            warn!(
                operation = %operation_name,
                last_error = last_error.as_deref().unwrap_or("none"),
                "Operation timed out"
            );
            Err(RetryError::Timeout {
                operation: operation_name.to_string(),
                timeout: deadline.saturating_duration_since(started),
                last_error,
            })
        }
        None => Err(RetryError::Cancelled {
            operation: operation_name.to_string(),
        }),
    }
}
