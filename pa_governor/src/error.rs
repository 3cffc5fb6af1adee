use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Why a call was refused before reaching the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaReason {
    /// Daily call quota exhausted
    DailyQuota,
    /// Circuit breaker open
    CircuitOpen,
}

impl std::fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaReason::DailyQuota => write!(f, "daily quota exhausted"),
            QuotaReason::CircuitOpen => write!(f, "circuit breaker open"),
        }
    }
}

/// Outcome error delivered to callers of the governor
///
/// `Clone` so every waiter on a deduplicated request receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum GovernorError {
    #[error("Upstream unavailable: {reason}")]
    QuotaExceeded { reason: QuotaReason },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Upstream call failed: {0}")]
    Upstream(Arc<anyhow::Error>),

    #[error("Upstream cooling down for another {remaining:?}")]
    Cooldown { remaining: Duration },

    #[error("Unknown rate limit rule: {0}")]
    UnknownRule(String),

    #[error("Request queue cleared")]
    QueueCleared,

    #[error("Governor shut down")]
    Shutdown,

    #[error("Request abandoned before completion")]
    Abandoned,
}

impl GovernorError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, GovernorError::QuotaExceeded { reason: QuotaReason::DailyQuota })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GovernorError::QuotaExceeded { reason: QuotaReason::CircuitOpen })
    }

    /// The upstream error, if the call reached the upstream and failed
    pub fn upstream(&self) -> Option<&anyhow::Error> {
        match self {
            GovernorError::Upstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Error an upstream call returns to report an explicit rate-limit response
///
/// The governor recognises it in the failure chain and starts the cooldown,
/// for `retry_after` when given, otherwise for the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Upstream reported rate limiting")]
pub struct UpstreamThrottled {
    pub retry_after: Option<Duration>,
}

pub type Outcome<T> = std::result::Result<T, GovernorError>;
