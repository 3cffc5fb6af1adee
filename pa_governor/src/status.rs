use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::breaker::BreakerStateKind;
use crate::priority::Priority;

/// Read-only snapshot of the governor for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernorStatus {
    pub quota_used: u32,
    pub quota_limit: u32,
    pub quota_remaining: u32,
    /// Next quota reset as a unix timestamp (seconds, UTC)
    pub quota_reset_at: i64,
    pub time_until_reset: Duration,
    pub breaker_state: BreakerStateKind,
    /// Time until an open circuit admits its recovery probe
    pub breaker_retry_in: Option<Duration>,
    pub queue_depths: BTreeMap<Priority, usize>,
    pub queued_total: usize,
    pub cooldown_remaining: Option<Duration>,
    pub upstream_calls_last_second: usize,
    pub upstream_calls_in_burst_window: usize,
}
