use std::time::Duration;

use pa_ratelimit::time;
use pa_ratelimit::time::Instant;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use tracing::warn;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected until `next_attempt`
    Open { next_attempt: Instant },
    /// Probing recovery, one call in flight at a time
    HalfOpen,
}

impl CircuitState {
    pub fn kind(&self) -> BreakerStateKind {
        match self {
            CircuitState::Closed => BreakerStateKind::Closed,
            CircuitState::Open { .. } => BreakerStateKind::Open,
            CircuitState::HalfOpen => BreakerStateKind::HalfOpen,
        }
    }
}

/// Serializable tag of [`CircuitState`] for status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Pass,
    /// The single half-open recovery probe
    Probe,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time to keep the circuit open before probing
    pub recovery_timeout: Duration,

    /// Successful probes needed to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(60), success_threshold: 1 }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,

    /// Consecutive failures while closed, probes still owed while half-open
    counter: u32,

    probe_in_flight: bool,
}

/// Circuit breaker guarding the upstream call path
///
/// The breaker never transitions speculatively: `check_allow` only moves an
/// expired Open circuit to HalfOpen, and every other transition follows a
/// recorded call outcome.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        assert!(config.failure_threshold > 0, "Failure threshold must be greater than 0");
        assert!(config.success_threshold > 0, "Success threshold must be greater than 0");

        Self { config, inner: Mutex::new(BreakerInner { state: CircuitState::Closed, counter: 0, probe_in_flight: false }) }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Admit a call at `now`, claiming the half-open probe if due
    pub fn admit_at(&self, now: Instant) -> Option<Admission> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Some(Admission::Pass),
            CircuitState::Open { next_attempt } if now >= next_attempt => {
                info!("circuit breaker half-open, probing upstream");
                inner.state = CircuitState::HalfOpen;
                inner.counter = self.config.success_threshold;
                inner.probe_in_flight = true;
                Some(Admission::Probe)
            }
            CircuitState::Open { .. } => None,
            CircuitState::HalfOpen if inner.probe_in_flight => None,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Some(Admission::Probe)
            }
        }
    }

    /// Whether a call may proceed at `now`
    pub fn check_allow_at(&self, now: Instant) -> bool {
        self.admit_at(now).is_some()
    }

    pub fn check_allow(&self) -> bool {
        self.check_allow_at(time::now())
    }

    /// Whether `check_allow_at` would admit a call, without claiming the probe
    pub fn would_allow_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open { next_attempt } => now >= next_attempt,
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a successful upstream call admitted as `admission`
    ///
    /// Only the probe's outcome moves a half-open circuit; a call admitted
    /// while closed that finishes after the circuit opened is ignored.
    /// Returns true when this success closed the circuit.
    pub fn record_success(&self, admission: Admission) -> bool {
        let mut inner = self.inner.lock();

        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Pass) => {
                inner.counter = 0;
                false
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.probe_in_flight = false;
                inner.counter = inner.counter.saturating_sub(1);
                if inner.counter == 0 {
                    info!("circuit breaker closed, upstream recovered");
                    inner.state = CircuitState::Closed;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Record a failed upstream call admitted as `admission` at `now`
    ///
    /// Returns true when this failure opened the circuit.
    pub fn record_failure_at(&self, admission: Admission, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Pass) => {
                inner.counter += 1;
                if inner.counter >= self.config.failure_threshold {
                    warn!(failures = inner.counter, recovery_timeout = ?self.config.recovery_timeout, "circuit breaker opened");
                    self.open(&mut inner, now);
                    return true;
                }
                false
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                warn!(recovery_timeout = ?self.config.recovery_timeout, "half-open probe failed, circuit breaker re-opened");
                self.open(&mut inner, now);
                true
            }
            _ => false,
        }
    }

    pub fn record_failure(&self, admission: Admission) -> bool {
        self.record_failure_at(admission, time::now())
    }

    /// Give back an admitted probe whose call never reached the upstream
    pub fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open { next_attempt: time::after(now, self.config.recovery_timeout) };
        inner.counter = 0;
        inner.probe_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time until an open circuit admits its probe
    pub fn retry_in_at(&self, now: Instant) -> Option<Duration> {
        match self.inner.lock().state {
            CircuitState::Open { next_attempt } => Some(time::until(next_attempt, now)),
            _ => None,
        }
    }

    /// Consecutive failures (closed) or outstanding probe successes (half-open)
    pub fn counter(&self) -> u32 {
        self.inner.lock().counter
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig { failure_threshold, recovery_timeout: Duration::from_secs(60), success_threshold })
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit_at(time::now()), Some(Admission::Pass));
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 1);
        let now = time::now();

        assert!(!cb.record_failure_at(Admission::Pass, now));
        assert!(!cb.record_failure_at(Admission::Pass, now));
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.record_failure_at(Admission::Pass, now));
        assert_eq!(cb.state(), CircuitState::Open { next_attempt: now + Duration::from_secs(60) });
        assert!(!cb.check_allow_at(now + Duration::from_secs(59)));
        assert_eq!(cb.retry_in_at(now + Duration::from_secs(59)), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_closed_counter() {
        let cb = breaker(3, 1);
        let now = time::now();

        cb.record_failure_at(Admission::Pass, now);
        cb.record_failure_at(Admission::Pass, now);
        cb.record_success(Admission::Pass);
        assert_eq!(cb.counter(), 0);

        cb.record_failure_at(Admission::Pass, now);
        cb.record_failure_at(Admission::Pass, now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breaker(1, 1);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        let later = now + Duration::from_secs(60);
        assert!(cb.would_allow_at(later));
        assert!(cb.check_allow_at(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Probe still in flight
        assert!(!cb.would_allow_at(later));
        assert!(!cb.check_allow_at(later));

        assert!(cb.record_success(Admission::Probe));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check_allow_at(later));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 1);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        let later = now + Duration::from_secs(61);
        assert!(cb.check_allow_at(later));
        assert!(cb.record_failure_at(Admission::Probe, later));
        assert_eq!(cb.state(), CircuitState::Open { next_attempt: later + Duration::from_secs(60) });
    }

    #[test]
    fn test_success_threshold_counts_down() {
        let cb = breaker(1, 3);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        let later = now + Duration::from_secs(60);
        for remaining in [2, 1] {
            assert!(cb.check_allow_at(later));
            assert!(!cb.record_success(Admission::Probe));
            assert_eq!(cb.state(), CircuitState::HalfOpen);
            assert_eq!(cb.counter(), remaining);
        }

        assert!(cb.check_allow_at(later));
        assert!(cb.record_success(Admission::Probe));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_released_probe_can_be_reclaimed() {
        let cb = breaker(1, 1);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        let later = now + Duration::from_secs(60);
        assert_eq!(cb.admit_at(later), Some(Admission::Probe));
        cb.release_probe();
        assert_eq!(cb.admit_at(later), Some(Admission::Probe));
        assert_eq!(cb.admit_at(later), None);
    }

    #[test]
    fn test_late_outcomes_ignored_while_open() {
        let cb = breaker(1, 1);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        assert!(!cb.record_failure_at(Admission::Pass, now));
        assert!(!cb.record_success(Admission::Pass));
        assert_eq!(cb.state().kind(), BreakerStateKind::Open);
    }

    #[test]
    fn test_stale_outcomes_do_not_settle_probe() {
        let cb = breaker(1, 3);
        let now = time::now();
        cb.record_failure_at(Admission::Pass, now);

        let later = now + Duration::from_secs(60);
        assert_eq!(cb.admit_at(later), Some(Admission::Probe));

        // Calls admitted before the circuit opened finish while the probe runs
        assert!(!cb.record_success(Admission::Pass));
        assert!(!cb.record_failure_at(Admission::Pass, later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.counter(), 3);
        assert_eq!(cb.admit_at(later), None);

        assert!(!cb.record_success(Admission::Probe));
        assert_eq!(cb.counter(), 2);
        assert_eq!(cb.admit_at(later), Some(Admission::Probe));
    }

    #[test]
    fn test_huge_recovery_timeout_clamped() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 1, recovery_timeout: Duration::MAX, success_threshold: 1 });
        let now = time::now();

        assert!(cb.record_failure_at(Admission::Pass, now));
        assert_eq!(cb.retry_in_at(now), Some(time::MAX_HORIZON));
        assert_eq!(cb.admit_at(now + Duration::from_secs(86_400)), None);
    }
}
