use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::error::RateLimitError;
use crate::error::Result;
use crate::keyed::DEFAULT_MAX_IDENTIFIERS;
use crate::limiter::RateLimiter;
use crate::sliding_window::SlidingWindow;
use crate::time;
use crate::time::Instant;
use crate::token_bucket::TokenBucket;
use crate::violations::ViolationPolicy;
use crate::violations::ViolationTracker;

/// Limiting strategy selected per rule at configuration time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    /// Exact count of requests within a trailing window
    SlidingWindow { capacity: u32, window: Duration },

    /// Continuous refill, bursts up to capacity
    TokenBucket { capacity: u32, refill_per_sec: f64 },
}

impl Strategy {
    /// Build the limiter implementing this strategy
    pub fn build(&self, max_identifiers: usize) -> Result<Box<dyn RateLimiter>> {
        let limiter: Box<dyn RateLimiter> = match *self {
            Strategy::SlidingWindow { capacity, window } => {
                Box::new(SlidingWindow::builder().capacity(capacity).window(window).max_identifiers(max_identifiers).build()?)
            }
            Strategy::TokenBucket { capacity, refill_per_sec } => {
                Box::new(TokenBucket::builder().capacity(capacity).rate_per_second(refill_per_sec).max_identifiers(max_identifiers).build()?)
            }
        };
        Ok(limiter)
    }
}

/// A named limiter plus its violation escalation
pub struct Rule {
    name: String,
    limiter: Box<dyn RateLimiter>,
    violations: ViolationTracker,
}

impl Rule {
    pub fn new(name: impl Into<String>, strategy: Strategy, policy: ViolationPolicy, max_identifiers: usize) -> Result<Self> {
        if policy.threshold == 0 {
            return Err(RateLimitError::InvalidConfig("violation threshold must be greater than 0"));
        }

        Ok(Self { name: name.into(), limiter: strategy.build(max_identifiers)?, violations: ViolationTracker::new(policy, max_identifiers) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &dyn RateLimiter {
        self.limiter.as_ref()
    }

    /// Blocked identifiers are refused outright; otherwise the strategy decides
    /// and every rejection counts toward a block.
    pub fn check_at(&self, identifier: &str, now: Instant) -> Result<()> {
        if let Some(retry_after) = self.violations.blocked_for(identifier, now) {
            return Err(RateLimitError::Blocked { retry_after });
        }

        match self.limiter.check_at(identifier, now) {
            Ok(()) => {
                self.violations.record_admission(identifier);
                Ok(())
            }
            Err(err) => match self.violations.record_violation(identifier, now) {
                Some(block) => {
                    warn!(rule = %self.name, identifier, ?block, "identifier blocked after repeated rate limit violations");
                    Err(RateLimitError::Blocked { retry_after: block })
                }
                None => Err(err),
            },
        }
    }

    pub fn reset(&self, identifier: &str) {
        self.limiter.reset(identifier);
        self.violations.reset(identifier);
    }

    fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize {
        self.limiter.evict_idle(now, max_idle) + self.violations.evict_idle(now, max_idle)
    }
}

/// Registry of named rules for the general-purpose per-identifier limiters
pub struct RuleSet {
    rules: HashMap<String, Rule>,
}

impl RuleSet {
    /// Create a new rule set builder
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::new()
    }

    /// An empty rule set; every check reports an unknown rule
    pub fn empty() -> Self {
        Self { rules: HashMap::new() }
    }

    pub fn get(&self, rule: &str) -> Option<&Rule> {
        self.rules.get(rule)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Check `identifier` against `rule` at `now`
    pub fn check_at(&self, rule: &str, identifier: &str, now: Instant) -> Result<()> {
        self.rules.get(rule).ok_or_else(|| RateLimitError::UnknownRule(rule.to_owned()))?.check_at(identifier, now)
    }

    /// Check `identifier` against `rule` at the current time
    pub fn check(&self, rule: &str, identifier: &str) -> Result<()> {
        self.check_at(rule, identifier, time::now())
    }

    /// Drop idle identifier state across every rule
    pub fn evict_idle_at(&self, now: Instant, max_idle: Duration) -> usize {
        self.rules.values().map(|rule| rule.evict_idle(now, max_idle)).sum()
    }

    /// Identifiers tracked across every rule's limiter
    pub fn tracked(&self) -> usize {
        self.rules.values().map(|rule| rule.limiter.tracked()).sum()
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self { rules: iter.into_iter().map(|rule| (rule.name.clone(), rule)).collect() }
    }
}

/// Builder for creating a rule set
pub struct RuleSetBuilder {
    rules: Vec<(String, Strategy, ViolationPolicy)>,
    max_identifiers: usize,
}

impl RuleSetBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self { rules: Vec::new(), max_identifiers: DEFAULT_MAX_IDENTIFIERS }
    }

    /// Add a rule; a later rule with the same name replaces the earlier one
    pub fn with_rule(mut self, name: impl Into<String>, strategy: Strategy, policy: ViolationPolicy) -> Self {
        self.rules.push((name.into(), strategy, policy));
        self
    }

    /// Bound the identifiers each rule keeps in memory
    pub fn max_identifiers(mut self, max_identifiers: usize) -> Self {
        self.max_identifiers = max_identifiers;
        self
    }

    /// Build the rule set
    pub fn build(self) -> Result<RuleSet> {
        let mut rules = HashMap::with_capacity(self.rules.len());
        for (name, strategy, policy) in self.rules {
            let rule = Rule::new(name.clone(), strategy, policy, self.max_identifiers)?;
            rules.insert(name, rule);
        }
        Ok(RuleSet { rules })
    }
}

impl Default for RuleSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}
