//! Bounded retry of provider calls that fail transiently.

use std::future::Future;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::error::{ProviderError, ProviderResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::readiness::BackoffPolicy;

/// How many times to try a provider call and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(30)),
        }
    }
}

/// Result of a retried call.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The call settled: success, a non-retryable error, or retries exhausted.
    Done {
        result: ProviderResult<T>,
        attempts: u32,
    },
    /// Cancelled while backing off after a transient error.
    Cancelled {
        attempts: u32,
        last_error: ProviderError,
    },
}

/// Invoke `call` until it succeeds, fails non-transiently, or
/// `policy.max_attempts` is reached.
///
/// Only [`ProviderError::Transient`] is retried. An attempt already in flight
/// is always awaited; cancellation only cuts the backoff sleep short.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    id: &str,
    operation: &'static str,
    cancel: &CancelSignal,
    mut call: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match call().await {
            Ok(value) => {
                return RetryOutcome::Done {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => err,
            Err(err) => {
                return RetryOutcome::Done {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        };

        let delay = policy.backoff.delay_for(attempt - 1);
        METRICS.inc_transient_retries();
        obs::emit_retry(id, operation, attempt, delay, &err);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome::Cancelled {
                    attempts: attempt,
                    last_error: err,
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
