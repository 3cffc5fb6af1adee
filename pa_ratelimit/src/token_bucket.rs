use std::time::Duration;

use crate::error::RateLimitError;
use crate::error::Result;
use crate::keyed::KeyedState;
use crate::keyed::DEFAULT_MAX_IDENTIFIERS;
use crate::limiter::RateLimiter;
use crate::time;
use crate::time::Instant;

/// Token state for a single identifier
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self { tokens: capacity, last_refill: now }
    }

    /// Add tokens for the time elapsed since the last refill, clamped to capacity
    #[inline(always)]
    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = time::elapsed_secs(self.last_refill, now);
        self.tokens = (self.tokens + elapsed * refill_rate).clamp(0.0, capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Token bucket rate limiter with continuous refill per identifier
///
/// Every identifier starts with a full bucket. Tokens refill continuously at
/// `refill_rate` per second up to `capacity`, so bursts up to `capacity` pass
/// and sustained traffic is held to the refill rate. A rejection reports the
/// time until one whole token is available.
pub struct TokenBucket {
    /// Maximum number of tokens (burst size)
    capacity: u32,

    /// Tokens added per second
    refill_rate: f64,

    buckets: KeyedState<Bucket>,
}

impl TokenBucket {
    /// Create a new token bucket rate limiter
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        assert!(capacity > 0, "Capacity must be greater than 0");
        assert!(refill_rate > 0.0 && refill_rate.is_finite(), "Refill rate must be greater than 0");

        Self::with_max_identifiers(capacity, refill_rate, DEFAULT_MAX_IDENTIFIERS)
    }

    fn with_max_identifiers(capacity: u32, refill_rate: f64, max_identifiers: usize) -> Self {
        Self { capacity, refill_rate, buckets: KeyedState::new(max_identifiers) }
    }

    /// Create a builder for configuring a token bucket
    pub fn builder() -> TokenBucketBuilder {
        TokenBucketBuilder::new()
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Fractional tokens available to `identifier` at `now`
    pub fn tokens_at(&self, identifier: &str, now: Instant) -> f64 {
        let capacity = self.capacity as f64;
        self.buckets
            .peek(identifier, |bucket| {
                let mut bucket = *bucket;
                bucket.refill(capacity, self.refill_rate, now);
                bucket.tokens
            })
            .unwrap_or(capacity)
    }
}

impl RateLimiter for TokenBucket {
    fn check_at(&self, identifier: &str, now: Instant) -> Result<()> {
        let capacity = self.capacity as f64;
        let refill_rate = self.refill_rate;

        self.buckets.with(
            identifier,
            now,
            || Bucket::full(capacity, now),
            |bucket| {
                bucket.refill(capacity, refill_rate, now);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                let retry_after = Duration::try_from_secs_f64((1.0 - bucket.tokens) / refill_rate).unwrap_or(time::MAX_HORIZON);
                Err(RateLimitError::Exceeded { retry_after })
            },
        )
    }

    fn remaining_at(&self, identifier: &str, now: Instant) -> u32 {
        self.tokens_at(identifier, now).floor() as u32
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn reset(&self, identifier: &str) {
        self.buckets.remove(identifier);
    }

    fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize {
        self.buckets.evict_idle(now, max_idle)
    }

    fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// Builder for configuring a token bucket rate limiter
pub struct TokenBucketBuilder {
    capacity: Option<u32>,
    rate: Option<f64>,
    max_identifiers: usize,
}

impl TokenBucketBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self { capacity: None, rate: None, max_identifiers: DEFAULT_MAX_IDENTIFIERS }
    }

    /// Set the bucket capacity (max tokens)
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the refill rate in tokens per second
    pub fn rate_per_second(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Set rate in requests per minute
    pub fn rate_per_minute(mut self, rate: f64) -> Self {
        self.rate = Some(rate / 60.0);
        self
    }

    /// Bound the number of identifiers kept in memory
    pub fn max_identifiers(mut self, max_identifiers: usize) -> Self {
        self.max_identifiers = max_identifiers;
        self
    }

    /// Build the token bucket
    pub fn build(self) -> Result<TokenBucket> {
        let capacity = self.capacity.ok_or(RateLimitError::InvalidConfig("capacity must be set"))?;
        let rate = self.rate.ok_or(RateLimitError::InvalidConfig("refill rate must be set"))?;

        if capacity == 0 {
            return Err(RateLimitError::InvalidConfig("capacity must be greater than 0"));
        }
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(RateLimitError::InvalidConfig("refill rate must be a positive number"));
        }

        Ok(TokenBucket::with_max_identifiers(capacity, rate, self.max_identifiers))
    }
}

impl Default for TokenBucketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_creation() {
        let bucket = TokenBucket::new(100, 50.0);
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.remaining("fresh"), 100);
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5, 1.0);
        let now = time::now();

        for _ in 0..5 {
            assert!(bucket.check_at("user", now).is_ok());
        }
        assert!(bucket.check_at("user", now).is_err());
    }

    #[test]
    fn test_refill_after_drain() {
        let bucket = TokenBucket::new(10, 1.0);
        let base = time::now();

        for _ in 0..10 {
            assert!(bucket.check_at("user", base).is_ok());
        }
        assert_eq!(bucket.remaining_at("user", base), 0);

        // Five seconds at 1 token/s refills exactly five tokens
        let later = base + Duration::from_secs(5);
        assert_eq!(bucket.remaining_at("user", later), 5);
        for _ in 0..5 {
            assert!(bucket.check_at("user", later).is_ok());
        }
        assert!(matches!(bucket.check_at("user", later), Err(RateLimitError::Exceeded { .. })));
    }

    #[test]
    fn test_retry_after() {
        let bucket = TokenBucket::new(1, 2.0);
        let now = time::now();

        assert!(bucket.check_at("user", now).is_ok());
        let err = bucket.check_at("user", now).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));

        // Half a token after 250ms, so another 250ms to go
        let err = bucket.check_at("user", now + Duration::from_millis(250)).unwrap_err();
        let retry = err.retry_after().unwrap();
        assert!(retry > Duration::from_millis(249) && retry < Duration::from_millis(251), "got {retry:?}");
    }

    #[test]
    fn test_refill_clamped_to_capacity() {
        let bucket = TokenBucket::new(3, 10.0);
        let base = time::now();

        assert!(bucket.check_at("user", base).is_ok());
        assert_eq!(bucket.tokens_at("user", base + Duration::from_secs(60)), 3.0);
    }

    #[test]
    fn test_builder_per_minute() {
        let bucket = TokenBucket::builder().capacity(120).rate_per_minute(60.0).build().unwrap();

        assert_eq!(bucket.capacity(), 120);
        assert_eq!(bucket.refill_rate(), 1.0);
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(TokenBucket::builder().capacity(1).build().is_err());
        assert!(TokenBucket::builder().capacity(1).rate_per_second(0.0).build().is_err());
        assert!(TokenBucket::builder().capacity(1).rate_per_second(f64::NAN).build().is_err());
        assert!(TokenBucket::builder().capacity(0).rate_per_second(1.0).build().is_err());
    }

    #[test]
    fn test_reset() {
        let bucket = TokenBucket::new(2, 0.1);
        let now = time::now();

        bucket.check_at("user", now).unwrap();
        bucket.check_at("user", now).unwrap();
        assert!(bucket.check_at("user", now).is_err());

        bucket.reset("user");
        assert!(bucket.check_at("user", now).is_ok());
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..50,
            rate in 0.1f64..100.0,
            gaps in proptest::collection::vec(0u64..2_000, 1..80),
        ) {
            let bucket = TokenBucket::new(capacity, rate);
            let mut now = time::now();

            for gap in gaps {
                now += Duration::from_millis(gap);
                let _ = bucket.check_at("key", now);
                let tokens = bucket.tokens_at("key", now);
                prop_assert!(tokens >= 0.0);
                prop_assert!(tokens <= capacity as f64);
            }
        }
    }
}
