use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::RateLimitError;
use crate::error::Result;
use crate::time;
use crate::time::Instant;

/// Window used for the sustained-rate sequence
pub const SUSTAINED_WINDOW: Duration = Duration::from_secs(1);

/// Configuration for the sustained + burst limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualLimiterConfig {
    /// Minimum spacing between consecutive permits at neutral priority
    pub sustained_interval: Duration,

    /// Maximum permits within one burst window
    pub burst_capacity: u32,

    /// Length of the burst window
    pub burst_window: Duration,
}

impl Default for DualLimiterConfig {
    fn default() -> Self {
        Self {
            sustained_interval: Duration::from_millis(1250), // 1/s upstream, with headroom for high-priority shortening
            burst_capacity: 10,
            burst_window: Duration::from_secs(10),
        }
    }
}

impl DualLimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.burst_capacity == 0 {
            return Err(RateLimitError::InvalidConfig("burst capacity must be greater than 0"));
        }
        if self.burst_window.is_zero() {
            return Err(RateLimitError::InvalidConfig("burst window must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DualState {
    /// Permits within the last second (may hold reserved future slots)
    sustained: VecDeque<Instant>,

    /// Permits within the burst window (may hold reserved future slots)
    burst: VecDeque<Instant>,

    /// Most recent permit, kept even after it leaves both windows
    last_permit: Option<Instant>,
}

/// Permit counts observed by the dual limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DualUsage {
    pub last_second: usize,
    pub burst_window: usize,
}

/// Sustained + burst limiter for a single shared upstream
///
/// Unlike the per-identifier limiters this one delays instead of rejecting:
/// `acquire` reserves the earliest slot that respects both the burst cap (no
/// more than `burst_capacity` permits within `burst_window`) and the sustained
/// spacing since the previous permit, then sleeps until that slot. The spacing
/// is scaled by a caller-supplied factor so higher-priority callers wait less.
///
/// Slots are reserved under a lock in call order, so permits are granted in
/// the order `reserve`/`acquire` were called even when the waits overlap.
pub struct DualLimiter {
    config: DualLimiterConfig,
    state: Mutex<DualState>,
}

impl DualLimiter {
    /// Create a new dual limiter
    pub fn new(config: DualLimiterConfig) -> Self {
        assert!(config.burst_capacity > 0, "Burst capacity must be greater than 0");
        assert!(!config.burst_window.is_zero(), "Burst window must be greater than 0");

        Self { config, state: Mutex::new(DualState::default()) }
    }

    pub fn config(&self) -> DualLimiterConfig {
        self.config
    }

    /// Drop entries that have left their windows
    #[inline(always)]
    fn trim(&self, state: &mut DualState, now: Instant) {
        while state.sustained.front().is_some_and(|&t| now.saturating_duration_since(t) >= SUSTAINED_WINDOW) {
            state.sustained.pop_front();
        }
        while state.burst.front().is_some_and(|&t| now.saturating_duration_since(t) >= self.config.burst_window) {
            state.burst.pop_front();
        }
    }

    /// Earliest instant a permit with `spacing_factor` may be granted
    fn next_slot(&self, state: &DualState, now: Instant, spacing_factor: f64) -> Instant {
        let mut slot = now;

        // Burst: wait for the oldest of the last `capacity` permits to leave the window
        let capacity = self.config.burst_capacity as usize;
        if state.burst.len() >= capacity {
            let gate = time::after(state.burst[state.burst.len() - capacity], self.config.burst_window);
            slot = slot.max(gate);
        }

        // Sustained: keep the scaled spacing from the previous permit
        if let Some(last) = state.last_permit {
            let spacing = Duration::try_from_secs_f64(self.config.sustained_interval.as_secs_f64() * sanitize_factor(spacing_factor)).unwrap_or(time::MAX_HORIZON);
            slot = slot.max(time::after(last, spacing));
        }

        slot
    }

    /// How long a permit requested at `now` would wait, without reserving it
    pub fn delay_at(&self, now: Instant, spacing_factor: f64) -> Duration {
        let mut state = self.state.lock();
        self.trim(&mut state, now);
        time::until(self.next_slot(&state, now, spacing_factor), now)
    }

    /// How long a permit requested now would wait
    pub fn delay(&self, spacing_factor: f64) -> Duration {
        self.delay_at(time::now(), spacing_factor)
    }

    /// Reserve the next permit slot, recording it in both windows
    pub fn reserve_at(&self, now: Instant, spacing_factor: f64) -> Instant {
        let mut state = self.state.lock();
        self.trim(&mut state, now);

        let slot = self.next_slot(&state, now, spacing_factor);
        state.sustained.push_back(slot);
        state.burst.push_back(slot);
        state.last_permit = Some(slot);
        slot
    }

    /// Reserve the next permit slot from now
    pub fn reserve(&self, spacing_factor: f64) -> Instant {
        self.reserve_at(time::now(), spacing_factor)
    }

    /// Wait for a previously reserved slot
    pub async fn wait_for(slot: Instant) -> Duration {
        let wait = time::until(slot, time::now());
        if !wait.is_zero() {
            debug!(?wait, "waiting for upstream permit");
            tokio::time::sleep_until(slot).await;
        }
        wait
    }

    /// Reserve a permit and suspend the caller until it is due
    ///
    /// Returns how long the caller was delayed.
    pub async fn acquire(&self, spacing_factor: f64) -> Duration {
        let slot = self.reserve(spacing_factor);
        Self::wait_for(slot).await
    }

    /// Permits granted within the last second and within the burst window
    pub fn usage_at(&self, now: Instant) -> DualUsage {
        let mut state = self.state.lock();
        self.trim(&mut state, now);

        DualUsage {
            last_second: state.sustained.iter().filter(|&&t| t <= now).count(),
            burst_window: state.burst.iter().filter(|&&t| t <= now).count(),
        }
    }

    pub fn usage(&self) -> DualUsage {
        self.usage_at(time::now())
    }

    /// Forget all recorded permits
    pub fn reset(&self) {
        *self.state.lock() = DualState::default();
    }
}

#[inline(always)]
fn sanitize_factor(factor: f64) -> f64 {
    if factor.is_finite() && factor >= 0.0 { factor } else { 1.0 }
}
