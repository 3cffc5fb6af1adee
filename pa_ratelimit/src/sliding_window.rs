use std::collections::VecDeque;
use std::time::Duration;

use crate::error::RateLimitError;
use crate::error::Result;
use crate::keyed::KeyedState;
use crate::keyed::DEFAULT_MAX_IDENTIFIERS;
use crate::limiter::RateLimiter;
use crate::time;
use crate::time::Instant;

/// Sliding window rate limiter keeping exact request timestamps per identifier
///
/// On each check, timestamps that have left the trailing window are discarded.
/// If `capacity` timestamps remain the request is rejected with the time until
/// the oldest of them exits the window; otherwise `now` is recorded. There is
/// no smoothing: any window-length span contains at most `capacity` admissions.
pub struct SlidingWindow {
    /// Maximum requests per identifier within one window
    capacity: u32,

    /// Length of the trailing window
    window: Duration,

    /// Admission timestamps per identifier, oldest first
    windows: KeyedState<VecDeque<Instant>>,
}

impl SlidingWindow {
    /// Create a new sliding window rate limiter
    pub fn new(capacity: u32, window: Duration) -> Self {
        assert!(capacity > 0, "Capacity must be greater than 0");
        assert!(!window.is_zero(), "Window duration must be greater than 0");

        Self::with_max_identifiers(capacity, window, DEFAULT_MAX_IDENTIFIERS)
    }

    fn with_max_identifiers(capacity: u32, window: Duration, max_identifiers: usize) -> Self {
        Self { capacity, window, windows: KeyedState::new(max_identifiers) }
    }

    /// Create a sliding window limiter with per-second limit
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    /// Create a sliding window limiter with per-minute limit
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Create a builder for configuring a sliding window limiter
    pub fn builder() -> SlidingWindowBuilder {
        SlidingWindowBuilder::new()
    }

    /// Length of the trailing window
    pub fn window(&self) -> Duration {
        self.window
    }

    #[inline(always)]
    fn trim(stamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&oldest) = stamps.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            stamps.pop_front();
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn check_at(&self, identifier: &str, now: Instant) -> Result<()> {
        let capacity = self.capacity as usize;
        let window = self.window;

        self.windows.with(identifier, now, VecDeque::new, |stamps| {
            Self::trim(stamps, window, now);

            if stamps.len() >= capacity {
                let oldest = stamps.front().copied().unwrap_or(now);
                return Err(RateLimitError::Exceeded { retry_after: time::until(time::after(oldest, window), now) });
            }

            stamps.push_back(now);
            Ok(())
        })
    }

    fn remaining_at(&self, identifier: &str, now: Instant) -> u32 {
        let window = self.window;
        let used = self
            .windows
            .peek(identifier, |stamps| stamps.iter().filter(|&&stamp| now.saturating_duration_since(stamp) < window).count())
            .unwrap_or(0);

        self.capacity.saturating_sub(used as u32)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn reset(&self, identifier: &str) {
        self.windows.remove(identifier);
    }

    fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize {
        self.windows.evict_idle(now, max_idle)
    }

    fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Builder for configuring a sliding window rate limiter
pub struct SlidingWindowBuilder {
    capacity: Option<u32>,
    window: Option<Duration>,
    max_identifiers: usize,
}

impl SlidingWindowBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self { capacity: None, window: None, max_identifiers: DEFAULT_MAX_IDENTIFIERS }
    }

    /// Set the capacity (max requests per window)
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the window duration
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Bound the number of identifiers kept in memory
    pub fn max_identifiers(mut self, max_identifiers: usize) -> Self {
        self.max_identifiers = max_identifiers;
        self
    }

    /// Build the sliding window limiter
    pub fn build(self) -> Result<SlidingWindow> {
        let capacity = self.capacity.ok_or(RateLimitError::InvalidConfig("capacity must be set"))?;
        let window = self.window.ok_or(RateLimitError::InvalidConfig("window must be set"))?;

        if capacity == 0 {
            return Err(RateLimitError::InvalidConfig("capacity must be greater than 0"));
        }
        if window.is_zero() {
            return Err(RateLimitError::InvalidConfig("window must be greater than 0"));
        }

        Ok(SlidingWindow::with_max_identifiers(capacity, window, self.max_identifiers))
    }
}

impl Default for SlidingWindowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
