use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::UtcOffset;
use tracing::info;
use tracing::warn;

/// Daily call counter that resets at UTC midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounter {
    pub used: u32,
    pub limit: u32,
    pub reset_at: OffsetDateTime,
}

/// Point-in-time view of the quota for status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub used: u32,
    /// Admitted calls whose outcome is not known yet
    pub in_flight: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    pub time_until_reset: Duration,
}

/// Next UTC midnight strictly after `now`
pub fn next_utc_midnight(now: OffsetDateTime) -> OffsetDateTime {
    let date = now.to_offset(UtcOffset::UTC).date();
    match date.next_day() {
        Some(next) => next.midnight().assume_utc(),
        None => PrimitiveDateTime::MAX.assume_utc(),
    }
}

#[derive(Debug)]
struct QuotaState {
    counter: QuotaCounter,
    in_flight: u32,
}

/// Daily quota tracker, independent of the per-second limiters
///
/// Only confirmed successful upstream calls consume quota. Admitted calls
/// hold a reservation until their outcome is known, so concurrent calls
/// cannot overshoot the limit. Once `used` reaches `limit` it stays there
/// until the next reset.
pub struct DailyQuota {
    state: Mutex<QuotaState>,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self::with_counter(QuotaCounter { used: 0, limit, reset_at: next_utc_midnight(now) })
    }

    pub fn with_counter(counter: QuotaCounter) -> Self {
        Self { state: Mutex::new(QuotaState { counter, in_flight: 0 }) }
    }

    #[inline(always)]
    fn roll_over(counter: &mut QuotaCounter, now: OffsetDateTime) {
        if now < counter.reset_at {
            return;
        }

        while now >= counter.reset_at {
            counter.reset_at += time::Duration::DAY;
        }
        info!(previous_used = counter.used, reset_at = %counter.reset_at, "daily quota reset");
        counter.used = 0;
    }

    /// Whether another upstream call fits in today's quota
    pub fn check_at(&self, now: OffsetDateTime) -> bool {
        let mut state = self.state.lock();
        Self::roll_over(&mut state.counter, now);
        state.counter.used + state.in_flight < state.counter.limit
    }

    pub fn check(&self) -> bool {
        self.check_at(OffsetDateTime::now_utc())
    }

    /// Whether today's quota is used up by confirmed calls alone
    pub fn is_exhausted_at(&self, now: OffsetDateTime) -> bool {
        let mut state = self.state.lock();
        Self::roll_over(&mut state.counter, now);
        state.counter.used >= state.counter.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_exhausted_at(OffsetDateTime::now_utc())
    }

    /// Hold quota for one admitted call
    pub fn reserve_at(&self, now: OffsetDateTime) -> bool {
        let mut state = self.state.lock();
        Self::roll_over(&mut state.counter, now);

        if state.counter.used + state.in_flight < state.counter.limit {
            state.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn reserve(&self) -> bool {
        self.reserve_at(OffsetDateTime::now_utc())
    }

    /// Give back a reservation whose call failed or never ran
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Count one confirmed successful upstream call, settling its reservation
    pub fn record_success_at(&self, now: OffsetDateTime) {
        let mut state = self.state.lock();
        Self::roll_over(&mut state.counter, now);
        state.in_flight = state.in_flight.saturating_sub(1);

        let counter = &mut state.counter;
        if counter.used < counter.limit {
            counter.used += 1;
            if counter.used == counter.limit {
                warn!(limit = counter.limit, reset_at = %counter.reset_at, "daily quota exhausted");
            }
        } else {
            warn!(limit = counter.limit, "upstream call succeeded with daily quota already exhausted");
        }
    }

    pub fn record_success(&self) {
        self.record_success_at(OffsetDateTime::now_utc())
    }

    pub fn snapshot_at(&self, now: OffsetDateTime) -> QuotaSnapshot {
        let mut state = self.state.lock();
        Self::roll_over(&mut state.counter, now);
        let counter = state.counter;

        QuotaSnapshot {
            used: counter.used,
            in_flight: state.in_flight,
            limit: counter.limit,
            remaining: counter.limit.saturating_sub(counter.used),
            reset_at: counter.reset_at,
            time_until_reset: Duration::try_from(counter.reset_at - now).unwrap_or(Duration::ZERO),
        }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        self.snapshot_at(OffsetDateTime::now_utc())
    }

    pub fn counter(&self) -> QuotaCounter {
        self.state.lock().counter
    }
}
