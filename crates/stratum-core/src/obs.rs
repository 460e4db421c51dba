//! Structured lifecycle events for provisioning runs.
//!
//! Each `emit_*` function logs one event with an `event` field, so JSON log
//! consumers can filter on it. Run-level fields (`run_id`, `direction`) come
//! from the `stratum.run` span the engine opens around every run.

use std::time::Duration;

use stratum_state::ResourceStatus;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::model::Direction;

pub fn emit_run_started(run_id: &str, direction: Direction, resources: usize, batches: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        direction = %direction,
        resources = resources,
        batches = batches,
    );
}

pub fn emit_batch_dispatched(index: usize, ids: &[String]) {
    info!(
        event = "batch.dispatched",
        batch = index,
        size = ids.len(),
        ids = %ids.join(","),
    );
}

/// A resource moved along its lifecycle.
pub fn emit_transition(id: &str, from: ResourceStatus, to: ResourceStatus) {
    info!(event = "resource.transition", id = %id, from = %from, to = %to);
}

pub fn emit_retry(id: &str, operation: &str, attempt: u32, delay: Duration, error: &ProviderError) {
    warn!(
        event = "resource.retry",
        id = %id,
        operation = %operation,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
    );
}

pub fn emit_skipped(id: &str, reason: &dyn std::fmt::Display) {
    info!(event = "resource.skipped", id = %id, reason = %reason);
}

pub fn emit_run_finished(run_id: &str, direction: Direction, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        direction = %direction,
        duration_ms = duration_ms,
        success = success,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        emit_run_started("run-1", Direction::Destroy, 3, 2);
        emit_batch_dispatched(0, &["network".to_string()]);
        emit_transition("network", ResourceStatus::Pending, ResourceStatus::Creating);
        emit_skipped("cluster", &"dependency network failed");
        emit_run_finished("run-1", Direction::Destroy, 12, false);
    }
}
