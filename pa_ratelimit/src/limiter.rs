use std::time::Duration;

use crate::error::Result;
use crate::time;
use crate::time::Instant;

/// Core trait for the per-identifier rate limiting strategies
///
/// Implementations keep independent state per identifier and never delay the
/// caller: a rejection reports how long to wait and leaves the decision to the
/// caller.
pub trait RateLimiter: Send + Sync {
    /// Admit one request for `identifier` at `now`, recording it on success
    fn check_at(&self, identifier: &str, now: Instant) -> Result<()>;

    /// Admit one request for `identifier` at the current time
    fn check(&self, identifier: &str) -> Result<()> {
        self.check_at(identifier, time::now())
    }

    /// Requests `identifier` could still make at `now` without being rejected
    fn remaining_at(&self, identifier: &str, now: Instant) -> u32;

    /// Requests `identifier` could still make right now
    fn remaining(&self, identifier: &str) -> u32 {
        self.remaining_at(identifier, time::now())
    }

    /// Get the maximum capacity per identifier
    fn capacity(&self) -> u32;

    /// Forget all state for `identifier`
    fn reset(&self, identifier: &str);

    /// Drop identifiers not seen for at least `max_idle`, returning how many were removed
    fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize;

    /// Number of identifiers currently tracked
    fn tracked(&self) -> usize;
}
