use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pa_ratelimit::DualLimiter;
use pa_ratelimit::RuleSet;
use pa_ratelimit::time;
use pa_ratelimit::time::Instant;
use tokio::sync::Notify;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::breaker::Admission;
use crate::breaker::CircuitBreaker;
use crate::breaker::CircuitState;
use crate::config::ConfigResult;
use crate::config::GovernorConfig;
use crate::cooldown::CooldownTracker;
use crate::error::GovernorError;
use crate::error::Outcome;
use crate::error::QuotaReason;
use crate::error::UpstreamThrottled;
use crate::metrics::Metrics;
use crate::quota::DailyQuota;

/// Why the gate is currently holding calls back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hold {
    Cooldown(Duration),
    Quota,
}

/// The single set of governance state for the upstream
///
/// Shared by every governor in the process: the dual limiter, circuit
/// breaker, daily quota, cooldown, per-identifier rules and metrics.
pub struct Gate {
    limiter: DualLimiter,
    breaker: CircuitBreaker,
    quota: DailyQuota,
    cooldown: CooldownTracker,
    rules: RuleSet,
    metrics: Metrics,
    idle_eviction: Duration,
    wake: Notify,
}

impl Gate {
    pub fn new(config: &GovernorConfig) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            limiter: DualLimiter::new(config.upstream.limiter_config()),
            breaker: CircuitBreaker::new(config.breaker.breaker_config()),
            quota: DailyQuota::new(config.quota.daily_limit),
            cooldown: CooldownTracker::new(config.cooldown.default_duration()),
            rules: config.build_rules()?,
            metrics: Metrics::default(),
            idle_eviction: config.limits.idle_eviction(),
            wake: Notify::new(),
        })
    }

    pub fn limiter(&self) -> &DualLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn quota(&self) -> &DailyQuota {
        &self.quota
    }

    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn idle_eviction(&self) -> Duration {
        self.idle_eviction
    }

    /// Wake every dispatcher waiting on this gate
    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.wake
    }

    /// Cooldown or exhausted quota, checked before the breaker
    pub(crate) fn hold_at(&self, now: Instant) -> Option<Hold> {
        if let Some(remaining) = self.cooldown.remaining_at(now) {
            return Some(Hold::Cooldown(remaining));
        }
        if self.quota.is_exhausted() {
            return Some(Hold::Quota);
        }
        None
    }

    /// Refuse new submissions outright while the quota is gone or the circuit is open
    pub(crate) fn precheck_at(&self, now: Instant) -> Outcome<()> {
        if self.quota.is_exhausted() {
            self.metrics.inc_quota_exceeded();
            warn!("daily quota exhausted, submission rejected");
            return Err(GovernorError::QuotaExceeded { reason: QuotaReason::DailyQuota });
        }
        if matches!(self.breaker.state(), CircuitState::Open { .. }) && !self.breaker.would_allow_at(now) {
            self.metrics.inc_breaker_rejections();
            warn!("circuit breaker open, submission rejected");
            return Err(GovernorError::QuotaExceeded { reason: QuotaReason::CircuitOpen });
        }
        Ok(())
    }

    /// Full admission check for a call made right away
    pub(crate) fn admit(self: &Arc<Self>) -> Outcome<Attempt> {
        let now = time::now();

        if let Some(remaining) = self.cooldown.remaining_at(now) {
            debug!(?remaining, "upstream cooling down, call rejected");
            return Err(GovernorError::Cooldown { remaining });
        }

        if !self.quota.reserve() {
            self.metrics.inc_quota_exceeded();
            warn!("daily quota exhausted, upstream call rejected");
            return Err(GovernorError::QuotaExceeded { reason: QuotaReason::DailyQuota });
        }

        match self.breaker.admit_at(now) {
            Some(admission) => Ok(Attempt::new(Arc::clone(self), admission)),
            None => {
                self.quota.release();
                self.metrics.inc_breaker_rejections();
                warn!("circuit breaker open, upstream call rejected");
                Err(GovernorError::QuotaExceeded { reason: QuotaReason::CircuitOpen })
            }
        }
    }

    /// Claim quota and breaker admission for a queued request, without counting refusals
    pub(crate) fn claim_at(self: &Arc<Self>, now: Instant) -> Option<Attempt> {
        if !self.quota.reserve() {
            return None;
        }

        match self.breaker.admit_at(now) {
            Some(admission) => Some(Attempt::new(Arc::clone(self), admission)),
            None => {
                self.quota.release();
                None
            }
        }
    }

    /// Run `identifier` through the named per-identifier rule
    pub fn check_rate_at(&self, rule: &str, identifier: &str, now: Instant) -> Outcome<()> {
        self.rules.check_at(rule, identifier, now).map_err(|err| match err.retry_after() {
            Some(retry_after) => {
                self.metrics.inc_rate_limited();
                debug!(rule, identifier, ?retry_after, "rate limited");
                GovernorError::RateLimited { retry_after }
            }
            None => GovernorError::UnknownRule(rule.to_owned()),
        })
    }

    /// Start the cooldown, returning how long it will last
    ///
    /// Only a cooldown that starts or outlasts the running one is counted.
    pub fn signal_rate_limited(&self, duration: Option<Duration>) -> Duration {
        let trigger = self.cooldown.trigger(duration);
        if trigger.extended {
            self.metrics.inc_cooldown_activations();
        }
        trigger.remaining
    }

    /// Drop per-identifier state idle for longer than the configured eviction age
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let evicted = self.rules.evict_idle_at(now, self.idle_eviction);
        if evicted > 0 {
            debug!(evicted, remaining = self.rules.tracked(), "evicted idle limiter state");
        }
        evicted
    }

    fn record_success(&self, admission: Admission) {
        self.metrics.inc_processed();
        self.breaker.record_success(admission);
        self.quota.record_success();
    }

    fn record_failure(&self, admission: Admission, err: &anyhow::Error) {
        self.metrics.inc_failed();
        self.quota.release();
        if self.breaker.record_failure(admission) {
            self.metrics.inc_breaker_activations();
        }

        if let Some(throttled) = err.chain().find_map(|cause| cause.downcast_ref::<UpstreamThrottled>()) {
            self.signal_rate_limited(throttled.retry_after);
        }
    }
}

/// A call admitted through the gate, settled exactly once by `run`
///
/// Holds a quota reservation and, for a half-open probe, the breaker's single
/// probe slot. Dropping it unsettled gives both back so a cancelled call
/// cannot wedge the circuit half-open or leak quota.
pub(crate) struct Attempt {
    gate: Arc<Gate>,
    admission: Admission,
    settled: bool,
}

impl Attempt {
    fn new(gate: Arc<Gate>, admission: Admission) -> Self {
        Self { gate, admission, settled: false }
    }

    /// Invoke the upstream call and record its outcome
    pub(crate) async fn run<R, F, Fut>(mut self, call: F) -> Outcome<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let result = AssertUnwindSafe(async move { call().await }).catch_unwind().await;
        self.settled = true;

        let outcome = match result {
            Ok(Ok(value)) => {
                self.gate.record_success(self.admission);
                Ok(value)
            }
            Ok(Err(err)) => {
                debug!(error = %err, "upstream call failed");
                self.gate.record_failure(self.admission, &err);
                Err(GovernorError::Upstream(Arc::new(err)))
            }
            Err(panic) => {
                let err = anyhow::anyhow!("upstream call panicked: {}", panic_message(panic.as_ref()));
                error!(error = %err, "upstream call panicked");
                self.gate.record_failure(self.admission, &err);
                Err(GovernorError::Upstream(Arc::new(err)))
            }
        };

        self.gate.wake();
        outcome
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        self.gate.quota.release();
        if self.admission == Admission::Probe {
            self.gate.breaker.release_probe();
        }
        self.gate.wake();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
