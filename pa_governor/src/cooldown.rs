use std::time::Duration;

use pa_ratelimit::time;
use pa_ratelimit::time::Instant;
use parking_lot::Mutex;
use tracing::info;
use tracing::warn;

/// Result of signalling a cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownTrigger {
    /// Time left in the cooldown now in force
    pub remaining: Duration,
    /// False when a longer cooldown was already running and was kept
    pub extended: bool,
}

/// Process-wide pause after an explicit upstream rate-limit signal
///
/// A coarse override on top of the breaker and limiters: while active, no
/// upstream call is admitted. It clears itself once the duration elapses.
pub struct CooldownTracker {
    default_duration: Duration,
    ends_at: Mutex<Option<Instant>>,
}

impl CooldownTracker {
    pub fn new(default_duration: Duration) -> Self {
        Self { default_duration, ends_at: Mutex::new(None) }
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Start (or extend) the cooldown at `now`
    ///
    /// An active cooldown that would outlast the new one is kept.
    pub fn trigger_at(&self, now: Instant, duration: Option<Duration>) -> CooldownTrigger {
        let duration = duration.unwrap_or(self.default_duration);
        let requested = time::after(now, duration);
        let mut ends_at = self.ends_at.lock();

        if let Some(current) = *ends_at {
            if current >= requested {
                return CooldownTrigger { remaining: time::until(current, now), extended: false };
            }
        }

        warn!(?duration, "upstream cooldown started");
        *ends_at = Some(requested);
        CooldownTrigger { remaining: time::until(requested, now), extended: true }
    }

    pub fn trigger(&self, duration: Option<Duration>) -> CooldownTrigger {
        self.trigger_at(time::now(), duration)
    }

    /// Time left in the cooldown, `None` when inactive
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let mut ends_at = self.ends_at.lock();

        match *ends_at {
            Some(end) if now < end => Some(time::until(end, now)),
            Some(_) => {
                info!("upstream cooldown ended");
                *ends_at = None;
                None
            }
            None => None,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(time::now())
    }

    pub fn is_in_cooldown_at(&self, now: Instant) -> bool {
        self.remaining_at(now).is_some()
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.is_in_cooldown_at(time::now())
    }

    /// End the cooldown early
    pub fn clear(&self) {
        *self.ends_at.lock() = None;
    }
}
