//! # pa_ratelimit
//!
//! Rate limiting primitives for the product-data API gate: per-identifier
//! sliding-window and token-bucket strategies with violation blocks, and the
//! sustained + burst limiter that spaces calls to the shared upstream.

pub mod dual;
pub mod error;
mod keyed;
pub mod limiter;
pub mod rules;
pub mod sliding_window;
pub mod time;
pub mod token_bucket;
pub mod violations;

pub use dual::DualLimiter;
pub use dual::DualLimiterConfig;
pub use dual::DualUsage;
pub use error::RateLimitError;
pub use error::Result;
pub use keyed::DEFAULT_MAX_IDENTIFIERS;
pub use limiter::RateLimiter;
pub use rules::Rule;
pub use rules::RuleSet;
pub use rules::RuleSetBuilder;
pub use rules::Strategy;
pub use sliding_window::SlidingWindow;
pub use sliding_window::SlidingWindowBuilder;
pub use token_bucket::TokenBucket;
pub use token_bucket::TokenBucketBuilder;
pub use violations::ViolationPolicy;
pub use violations::ViolationTracker;
