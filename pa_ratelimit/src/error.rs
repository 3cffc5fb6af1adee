use std::fmt;
use std::time::Duration;

/// Result type for rate limiting operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Rate limit exceeded for this identifier
    Exceeded { retry_after: Duration },

    /// Identifier is blocked after repeated violations
    Blocked { retry_after: Duration },

    /// No rule registered under this name
    UnknownRule(String),

    /// Invalid configuration
    InvalidConfig(&'static str),
}

impl RateLimitError {
    /// Suggested wait before the identifier may try again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Exceeded { retry_after } | RateLimitError::Blocked { retry_after } => Some(*retry_after),
            RateLimitError::UnknownRule(_) | RateLimitError::InvalidConfig(_) => None,
        }
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::Exceeded { retry_after } => write!(f, "Rate limit exceeded, retry after {retry_after:?}"),
            RateLimitError::Blocked { retry_after } => write!(f, "Identifier blocked, retry after {retry_after:?}"),
            RateLimitError::UnknownRule(name) => write!(f, "Unknown rate limit rule: {name}"),
            RateLimitError::InvalidConfig(msg) => write!(f, "Invalid rate limiter configuration: {}", msg),
        }
    }
}

impl std::error::Error for RateLimitError {}
