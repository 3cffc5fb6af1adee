use std::time::Duration;

pub use tokio::time::Instant;

/// Longest offset `after` will add; configured durations beyond it are clamped
pub const MAX_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Current time on the tokio clock
///
/// Outside a runtime this is the monotonic system clock. Inside a runtime with
/// a paused clock (tokio `test-util`) it follows virtual time, which keeps the
/// windowed limiters deterministic under test.
#[inline(always)]
pub fn now() -> Instant {
    Instant::now()
}

/// Seconds elapsed between two instants as a float, zero if `later` is earlier
#[inline(always)]
pub(crate) fn elapsed_secs(earlier: Instant, later: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64()
}

/// Time left until `deadline`, zero if it already passed
#[inline(always)]
pub fn until(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

/// `instant + duration`, clamped to `MAX_HORIZON` instead of overflowing
#[inline(always)]
pub fn after(instant: Instant, duration: Duration) -> Instant {
    instant.checked_add(duration.min(MAX_HORIZON)).unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_secs() {
        let base = now();
        assert_eq!(elapsed_secs(base, base + Duration::from_millis(1500)), 1.5);
        assert_eq!(elapsed_secs(base + Duration::from_secs(1), base), 0.0);
    }

    #[test]
    fn test_until() {
        let base = now();
        assert_eq!(until(base + Duration::from_secs(3), base), Duration::from_secs(3));
        assert_eq!(until(base, base + Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn test_after_clamps_huge_durations() {
        let base = now();
        assert_eq!(after(base, Duration::from_secs(5)), base + Duration::from_secs(5));
        assert_eq!(after(base, Duration::MAX), base + MAX_HORIZON);
        assert_eq!(until(after(base, Duration::from_millis(u64::MAX)), base), MAX_HORIZON);
    }
}
