use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

/// Monotonic counters shared by every governor on one gate
#[derive(Debug, Default)]
pub struct Metrics {
    processed: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    deduplicated: AtomicU64,
    direct_executes: AtomicU64,
    breaker_activations: AtomicU64,
    breaker_rejections: AtomicU64,
    quota_exceeded: AtomicU64,
    rate_limited: AtomicU64,
    cooldown_activations: AtomicU64,
    cleared: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Upstream calls that succeeded
    pub processed_count: u64,
    /// Upstream calls that failed or panicked
    pub failed_count: u64,
    /// Requests accepted into the queue
    pub queued_count: u64,
    /// Submissions attached to an in-flight request
    pub deduplicated_count: u64,
    /// Calls made through `execute`
    pub direct_execute_count: u64,
    /// Times the circuit breaker opened
    pub breaker_activations: u64,
    /// Calls refused because the circuit was open
    pub breaker_rejections: u64,
    /// Calls refused because the daily quota was exhausted
    pub quota_exceeded_count: u64,
    /// Per-identifier rejections from `check_rate`
    pub rate_limited_count: u64,
    /// Cooldowns started by the upstream or an operator
    pub cooldown_activations: u64,
    /// Requests cancelled by `clear`
    pub cleared_count: u64,
}

impl Metrics {
    pub(crate) fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_direct_executes(&self) {
        self.direct_executes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_breaker_activations(&self) {
        self.breaker_activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_breaker_rejections(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_quota_exceeded(&self) {
        self.quota_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cooldown_activations(&self) {
        self.cooldown_activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_cleared(&self, count: u64) {
        self.cleared.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed_count: self.processed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            queued_count: self.queued.load(Ordering::Relaxed),
            deduplicated_count: self.deduplicated.load(Ordering::Relaxed),
            direct_execute_count: self.direct_executes.load(Ordering::Relaxed),
            breaker_activations: self.breaker_activations.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            quota_exceeded_count: self.quota_exceeded.load(Ordering::Relaxed),
            rate_limited_count: self.rate_limited.load(Ordering::Relaxed),
            cooldown_activations: self.cooldown_activations.load(Ordering::Relaxed),
            cleared_count: self.cleared.load(Ordering::Relaxed),
        }
    }
}
