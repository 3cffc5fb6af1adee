//! # pa_governor
//!
//! Admission control for the product-data API. Calls are queued by business
//! priority, deduplicated by logical key and released one at a time through
//! the cooldown, daily quota, sustained + burst limiter and circuit breaker.

pub mod breaker;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod gate;
pub mod governor;
pub mod metrics;
pub mod priority;
mod queue;
pub mod quota;
pub mod status;

pub use breaker::Admission;
pub use breaker::BreakerStateKind;
pub use breaker::CircuitBreaker;
pub use breaker::CircuitBreakerConfig;
pub use breaker::CircuitState;
pub use config::ConfigError;
pub use config::GovernorConfig;
pub use cooldown::CooldownTracker;
pub use cooldown::CooldownTrigger;
pub use error::GovernorError;
pub use error::Outcome;
pub use error::QuotaReason;
pub use error::UpstreamThrottled;
pub use gate::Gate;
pub use governor::Governor;
pub use governor::Submission;
pub use governor::UpstreamCall;
pub use metrics::MetricsSnapshot;
pub use priority::Priority;
pub use quota::DailyQuota;
pub use quota::QuotaCounter;
pub use status::GovernorStatus;
