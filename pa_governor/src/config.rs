use std::collections::BTreeMap;
use std::time::Duration;

use pa_ratelimit::DualLimiterConfig;
use pa_ratelimit::RateLimitError;
use pa_ratelimit::Rule;
use pa_ratelimit::RuleSet;
use pa_ratelimit::Strategy;
use pa_ratelimit::ViolationPolicy;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::breaker::CircuitBreakerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid governor configuration: {0}")]
    Invalid(String),

    #[error("Invalid rule `{rule}`: {source}")]
    Rule { rule: String, source: RateLimitError },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Complete configuration for one governance gate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub quota: QuotaConfig,
    pub upstream: UpstreamConfig,
    pub breaker: BreakerConfig,
    pub cooldown: CooldownConfig,
    pub dispatcher: DispatcherConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Successful upstream calls allowed per UTC day
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 8640, // one call every 10s for a day
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Spacing between upstream calls at neutral priority
    pub sustained_interval_ms: u64,
    /// Calls allowed within one burst window
    pub burst_capacity: u32,
    pub burst_window_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { sustained_interval_ms: 1250, burst_capacity: 10, burst_window_ms: 10_000 }
    }
}

impl UpstreamConfig {
    pub fn limiter_config(&self) -> DualLimiterConfig {
        DualLimiterConfig {
            sustained_interval: Duration::from_millis(self.sustained_interval_ms),
            burst_capacity: self.burst_capacity,
            burst_window: Duration::from_millis(self.burst_window_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout_ms: 60_000, success_threshold: 1 }
    }
}

impl BreakerConfig {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            success_threshold: self.success_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Pause applied when the upstream signals rate limiting without a hint
    pub default_duration_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { default_duration_ms: 60_000 }
    }
}

impl CooldownConfig {
    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(self.default_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on how long the loop sleeps without a wake-up
    pub idle_poll_ms: u64,
    /// Dispatch the head request once its upstream slot is this close
    pub lookahead_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { idle_poll_ms: 100, lookahead_ms: 50 }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.idle_poll_ms == 0 {
            return Err(ConfigError::Invalid("dispatcher.idle_poll_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Identifiers each rule keeps before evicting the least recently seen
    pub max_identifiers: usize,
    /// Identifier state unused for this long is dropped by the sweep
    pub idle_eviction_ms: u64,
    pub rules: BTreeMap<String, RuleConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_identifiers: pa_ratelimit::DEFAULT_MAX_IDENTIFIERS, idle_eviction_ms: 3_600_000, rules: BTreeMap::new() }
    }
}

impl LimitsConfig {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SlidingWindow,
    TokenBucket,
}

/// One named per-identifier rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub strategy: StrategyKind,
    pub capacity: u32,
    /// Window length, sliding window only
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Tokens added per second, token bucket only
    #[serde(default)]
    pub refill_per_sec: Option<f64>,
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_block_ms() -> u64 {
    300_000
}

impl RuleConfig {
    pub fn strategy(&self, name: &str) -> ConfigResult<Strategy> {
        match self.strategy {
            StrategyKind::SlidingWindow => {
                let window_ms = self.window_ms.ok_or_else(|| ConfigError::Invalid(format!("rule `{name}` needs window_ms")))?;
                Ok(Strategy::SlidingWindow { capacity: self.capacity, window: Duration::from_millis(window_ms) })
            }
            StrategyKind::TokenBucket => {
                let refill_per_sec = self.refill_per_sec.ok_or_else(|| ConfigError::Invalid(format!("rule `{name}` needs refill_per_sec")))?;
                Ok(Strategy::TokenBucket { capacity: self.capacity, refill_per_sec })
            }
        }
    }

    pub fn policy(&self) -> ViolationPolicy {
        ViolationPolicy { threshold: self.violation_threshold, block_duration: Duration::from_millis(self.block_ms) }
    }
}

impl GovernorConfig {
    /// Reject configurations the gate cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.quota.daily_limit == 0 {
            return Err(ConfigError::Invalid("quota.daily_limit must be greater than 0".into()));
        }
        self.upstream.limiter_config().validate().map_err(|err| ConfigError::Invalid(format!("upstream: {err}")))?;
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid("breaker thresholds must be greater than 0".into()));
        }
        if self.limits.max_identifiers == 0 {
            return Err(ConfigError::Invalid("limits.max_identifiers must be greater than 0".into()));
        }
        self.dispatcher.validate()?;
        self.build_rules().map(|_| ())
    }

    /// Build the per-identifier rule registry
    pub fn build_rules(&self) -> ConfigResult<RuleSet> {
        self.limits
            .rules
            .iter()
            .map(|(name, rule)| -> ConfigResult<Rule> {
                Rule::new(name.clone(), rule.strategy(name)?, rule.policy(), self.limits.max_identifiers)
                    .map_err(|source| ConfigError::Rule { rule: name.clone(), source })
            })
            .collect()
    }
}
