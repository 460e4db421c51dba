//! Global atomic counters for provisioning runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event (the engine does so at the end of every run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    provider_creates: AtomicU64,
    provider_destroys: AtomicU64,
    transient_retries: AtomicU64,
    readiness_polls: AtomicU64,
    resources_skipped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            provider_creates: AtomicU64::new(0),
            provider_destroys: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            readiness_polls: AtomicU64::new(0),
            resources_skipped: AtomicU64::new(0),
        }
    }

    pub fn inc_provider_creates(&self) {
        self.provider_creates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "provider_creates", "counter incremented");
    }

    pub fn inc_provider_destroys(&self) {
        self.provider_destroys.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "provider_destroys", "counter incremented");
    }

    pub fn inc_transient_retries(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transient_retries", "counter incremented");
    }

    pub fn inc_readiness_polls(&self) {
        self.readiness_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resources_skipped(&self) {
        self.resources_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resources_skipped", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            provider_creates = self.provider_creates(),
            provider_destroys = self.provider_destroys(),
            transient_retries = self.transient_retries(),
            readiness_polls = self.readiness_polls(),
            resources_skipped = self.resources_skipped(),
        );
    }

    pub fn provider_creates(&self) -> u64 {
        self.provider_creates.load(Ordering::Relaxed)
    }

    pub fn provider_destroys(&self) -> u64 {
        self.provider_destroys.load(Ordering::Relaxed)
    }

    pub fn transient_retries(&self) -> u64 {
        self.transient_retries.load(Ordering::Relaxed)
    }

    pub fn readiness_polls(&self) -> u64 {
        self.readiness_polls.load(Ordering::Relaxed)
    }

    pub fn resources_skipped(&self) -> u64 {
        self.resources_skipped.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.provider_creates.store(0, Ordering::Relaxed);
        self.provider_destroys.store(0, Ordering::Relaxed);
        self.transient_retries.store(0, Ordering::Relaxed);
        self.readiness_polls.store(0, Ordering::Relaxed);
        self.resources_skipped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment_and_reset() {
        // A local instance so parallel tests touching METRICS don't interfere.
        let m = Metrics::new();
        m.inc_provider_creates();
        m.inc_provider_creates();
        m.inc_transient_retries();
        m.inc_resources_skipped();
        assert_eq!(m.provider_creates(), 2);
        assert_eq!(m.transient_retries(), 1);
        assert_eq!(m.resources_skipped(), 1);
        m.flush();
        m.reset();
        assert_eq!(m.provider_creates(), 0);
        assert_eq!(m.readiness_polls(), 0);
    }
}
