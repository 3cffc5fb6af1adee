use std::time::Duration;

use crate::keyed::KeyedState;
use crate::time;
use crate::time::Instant;

/// When repeated rejections escalate into an outright block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationPolicy {
    /// Consecutive rejections before the identifier is blocked
    pub threshold: u32,

    /// How long a blocked identifier is refused regardless of window state
    pub block_duration: Duration,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self { threshold: 5, block_duration: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ViolationRecord {
    count: u32,
    blocked_until: Option<Instant>,
}

impl ViolationRecord {
    fn is_blocked_at(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Per-identifier violation counts and timed blocks
///
/// Every rejection increments the identifier's counter; an admission resets
/// it. Reaching the threshold blocks the identifier until `now + block_duration`.
/// The block and the counter are cleared together once the block expires.
/// Identifiers under an active block are never evicted to make room for others.
pub struct ViolationTracker {
    policy: ViolationPolicy,
    records: KeyedState<ViolationRecord>,
}

impl ViolationTracker {
    pub fn new(policy: ViolationPolicy, max_identifiers: usize) -> Self {
        Self { policy, records: KeyedState::with_pinned(max_identifiers, ViolationRecord::is_blocked_at) }
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    /// Remaining block for `identifier`, clearing an expired block
    pub fn blocked_for(&self, identifier: &str, now: Instant) -> Option<Duration> {
        self.records
            .update_existing(identifier, |record| match record.blocked_until {
                Some(until) if now < until => Some(time::until(until, now)),
                Some(_) => {
                    *record = ViolationRecord::default();
                    None
                }
                None => None,
            })
            .flatten()
    }

    /// Count a rejection, returning the block duration if this one triggered a block
    pub fn record_violation(&self, identifier: &str, now: Instant) -> Option<Duration> {
        let policy = self.policy;

        self.records.with(identifier, now, ViolationRecord::default, |record| {
            record.count = record.count.saturating_add(1);
            if record.count >= policy.threshold && record.blocked_until.is_none() {
                record.blocked_until = Some(time::after(now, policy.block_duration));
                return Some(policy.block_duration);
            }
            None
        })
    }

    /// Reset the consecutive-violation counter after an admission
    pub fn record_admission(&self, identifier: &str) {
        self.records.update_existing(identifier, |record| {
            if record.blocked_until.is_none() {
                record.count = 0;
            }
        });
    }

    /// Consecutive violations currently counted for `identifier`
    pub fn violations(&self, identifier: &str) -> u32 {
        self.records.peek(identifier, |record| record.count).unwrap_or(0)
    }

    pub fn reset(&self, identifier: &str) {
        self.records.remove(identifier);
    }

    pub fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize {
        // Blocks outlive idleness: a blocked identifier is kept until the block ends
        let max_idle = max_idle.max(self.policy.block_duration);
        self.records.evict_idle(now, max_idle)
    }
}
