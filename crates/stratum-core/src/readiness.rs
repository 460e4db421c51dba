//! Readiness gate: poll an external probe with exponential backoff until it
//! reports ready, reports failure, or a timeout elapses.
//!
//! The gate never retries on its own after a timeout or failure; it only
//! reports what happened. Sleeps use `tokio::time` so tests can run them in
//! paused virtual time.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancelSignal;
use crate::error::ProviderResult;
use crate::metrics::METRICS;

/// Exponential backoff: `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Delay before retry/poll number `n + 1` (`n` starts at 0).
    pub fn delay_for(&self, n: u32) -> Duration {
        let exp = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

impl Default for BackoffPolicy {
    /// 2s, doubling, capped at 30s.
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 2.0, Duration::from_secs(30))
    }
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    /// Not there yet; `detail` is the provider's current state, kept for
    /// timeout diagnostics.
    Pending { detail: Option<String> },
    Ready(T),
    /// Terminal failure; polling further is pointless.
    Failed { reason: String },
}

impl<T> Poll<T> {
    pub fn pending() -> Self {
        Poll::Pending { detail: None }
    }

    pub fn pending_with(detail: impl Into<String>) -> Self {
        Poll::Pending {
            detail: Some(detail.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Poll::Failed {
            reason: reason.into(),
        }
    }
}

/// How a gate wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome<T> {
    Ready { value: T, polls: u32 },
    Failed { reason: String, polls: u32 },
    TimedOut {
        waited: Duration,
        last_observed: Option<String>,
    },
    Cancelled { last_observed: Option<String> },
}

/// Polls one resource's probe until a terminal answer or timeout.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessGate {
    pub policy: BackoffPolicy,
    pub timeout: Duration,
}

impl ReadinessGate {
    pub fn new(policy: BackoffPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    /// Poll `probe` until it settles.
    ///
    /// Transient probe errors count as "still pending"; any other probe error
    /// ends the wait as failed. Cancellation interrupts both the probe call
    /// and the backoff sleep.
    pub async fn wait<T, F, Fut>(&self, mut probe: F, cancel: &CancelSignal) -> GateOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<Poll<T>>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_observed: Option<String> = None;
        let mut polls: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return GateOutcome::Cancelled { last_observed };
            }

            polls += 1;
            METRICS.inc_readiness_polls();
            let observed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return GateOutcome::Cancelled { last_observed },
                observed = probe() => observed,
            };

            match observed {
                Ok(Poll::Ready(value)) => return GateOutcome::Ready { value, polls },
                Ok(Poll::Failed { reason }) => return GateOutcome::Failed { reason, polls },
                Ok(Poll::Pending { detail }) => {
                    if detail.is_some() {
                        last_observed = detail;
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(error = %err, "transient probe error, still waiting");
                    last_observed = Some(err.to_string());
                }
                Err(err) => {
                    return GateOutcome::Failed {
                        reason: err.to_string(),
                        polls,
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return GateOutcome::TimedOut {
                    waited: now - started,
                    last_observed,
                };
            }

            let delay = self.policy.delay_for(polls - 1).min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return GateOutcome::Cancelled { last_observed },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn gate(timeout_secs: u64) -> ReadinessGate {
        ReadinessGate::new(BackoffPolicy::default(), Duration::from_secs(timeout_secs))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..6).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let outcome = gate(900)
            .wait(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                            Ok(Poll::pending_with("PROVISIONING"))
                        } else {
                            Ok(Poll::Ready("up"))
                        }
                    }
                },
                &CancelSignal::never(),
            )
            .await;
        assert_eq!(outcome, GateOutcome::Ready { value: "up", polls: 4 });
        // 2 + 4 + 8 seconds of backoff elapsed in virtual time.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14) && elapsed < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_observation() {
        let outcome = gate(60)
            .wait(
                || async { Ok::<_, ProviderError>(Poll::<()>::pending_with("BACKING_UP")) },
                &CancelSignal::never(),
            )
            .await;
        match outcome {
            GateOutcome::TimedOut {
                waited,
                last_observed,
            } => {
                assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
                assert_eq!(last_observed.as_deref(), Some("BACKING_UP"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_probe_failure_stops_polling() {
        let outcome = gate(900)
            .wait(
                || async { Ok::<_, ProviderError>(Poll::<()>::failed("quota exceeded")) },
                &CancelSignal::never(),
            )
            .await;
        assert_eq!(
            outcome,
            GateOutcome::Failed {
                reason: "quota exceeded".into(),
                polls: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_probe_error_keeps_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = gate(900)
            .wait(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(ProviderError::rate_limited("429"))
                        } else {
                            Ok(Poll::Ready(()))
                        }
                    }
                },
                &CancelSignal::never(),
            )
            .await;
        assert_eq!(outcome, GateOutcome::Ready { value: (), polls: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_probe_error_fails() {
        let outcome = gate(900)
            .wait(
                || async { Err::<Poll<()>, _>(ProviderError::fatal("gone")) },
                &CancelSignal::never(),
            )
            .await;
        assert!(matches!(outcome, GateOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_mid_wait() {
        let (handle, signal) = cancel_pair();
        let task = tokio::spawn(async move {
            gate(900)
                .wait(
                    || async { Ok::<_, ProviderError>(Poll::<()>::pending_with("CREATING")) },
                    &signal,
                )
                .await
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            GateOutcome::Cancelled {
                last_observed: Some("CREATING".into())
            }
        );
    }
}
