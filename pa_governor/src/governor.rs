use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use pa_ratelimit::DualLimiter;
use pa_ratelimit::time;
use pa_ratelimit::time::Instant;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConfigResult;
use crate::config::DispatcherConfig;
use crate::config::GovernorConfig;
use crate::error::GovernorError;
use crate::error::Outcome;
use crate::error::QuotaReason;
use crate::gate::Gate;
use crate::gate::Hold;
use crate::metrics::MetricsSnapshot;
use crate::priority::Priority;
use crate::queue::PriorityQueue;
use crate::status::GovernorStatus;

/// One upstream call, invoked at most once by the dispatcher
pub type UpstreamCall<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct Request<T> {
    id: u64,
    dedup_key: Option<String>,
    call: UpstreamCall<T>,
    enqueued_at: Instant,
    completion: oneshot::Sender<Outcome<T>>,
}

struct QueueState<T> {
    queue: PriorityQueue<Request<T>>,
    /// In-flight requests by dedup key, tagged with the owning request id
    dedup: HashMap<String, (u64, SharedOutcome<T>)>,
    closed: bool,
}

struct Inner<T> {
    gate: Arc<Gate>,
    dispatcher: DispatcherConfig,
    state: Mutex<QueueState<T>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

enum Step {
    Dispatched,
    Idle(Option<Duration>),
}

/// Eventual result of a submitted request
///
/// Resolves once the upstream call completes, fails, or the request is
/// cancelled. Every submission sharing a dedup key resolves to the same outcome.
#[must_use = "a submission does nothing for the caller unless awaited"]
pub struct Submission<T> {
    id: Option<u64>,
    deduplicated: bool,
    outcome: SharedOutcome<T>,
}

impl<T: Clone + Send + Sync + 'static> Submission<T> {
    fn rejected(err: GovernorError) -> Self {
        Self { id: None, deduplicated: false, outcome: futures::future::ready(Err(err)).boxed().shared() }
    }

    /// Id of the queued request, `None` when the submission was refused outright
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Whether this submission joined a request already in flight
    pub fn is_deduplicated(&self) -> bool {
        self.deduplicated
    }
}

impl<T: Clone + Send + Sync + 'static> Future for Submission<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx)
    }
}

/// Removes a request's dedup entry however its task ends
struct DedupGuard<T> {
    inner: Weak<Inner<T>>,
    key: Option<String>,
    id: u64,
}

impl<T> Drop for DedupGuard<T> {
    fn drop(&mut self) {
        let (Some(key), Some(inner)) = (self.key.take(), self.inner.upgrade()) else {
            return;
        };

        let mut state = inner.state.lock();
        if state.dedup.get(&key).is_some_and(|(owner, _)| *owner == self.id) {
            state.dedup.remove(&key);
        }
    }
}

/// Admission queue and dispatcher in front of the upstream
///
/// Requests are queued per priority and released by a background loop when
/// the cooldown, daily quota, dual limiter and circuit breaker allow it.
/// Handles are cheap to clone; the loop stops on `shutdown` or once every
/// handle is dropped.
pub struct Governor<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Governor<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + Sync + 'static> Governor<T> {
    /// Build a gate from `config` and start a governor on it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &GovernorConfig) -> ConfigResult<Self> {
        let gate = Arc::new(Gate::new(config)?);
        Ok(Self::with_gate(gate, config.dispatcher.clone()))
    }

    /// Start a governor on an existing gate
    ///
    /// Governors sharing a gate share its limiter, breaker, quota, cooldown
    /// and metrics; each keeps its own queue and dispatcher loop.
    pub fn with_gate(gate: Arc<Gate>, dispatcher: DispatcherConfig) -> Self {
        let inner = Arc::new(Inner {
            gate,
            dispatcher,
            state: Mutex::new(QueueState { queue: PriorityQueue::new(), dedup: HashMap::new(), closed: false }),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        tokio::spawn(run_dispatcher(Arc::downgrade(&inner)));
        tokio::spawn(run_eviction_sweep(Arc::downgrade(&inner)));
        info!(idle_poll = ?inner.dispatcher.idle_poll(), lookahead = ?inner.dispatcher.lookahead(), "governor started");

        Self { inner }
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.inner.gate
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Queue an upstream call
    ///
    /// Never blocks: the request is queued (or joined to an in-flight request
    /// with the same `dedup_key`) before this returns. Await the returned
    /// [`Submission`] for the outcome.
    pub fn submit<F, Fut>(&self, priority: Priority, dedup_key: Option<&str>, call: F) -> Submission<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let gate = &self.inner.gate;
        let mut state = self.inner.state.lock();

        if state.closed {
            return Submission::rejected(GovernorError::Shutdown);
        }

        if let Some((id, outcome)) = dedup_key.and_then(|key| state.dedup.get(key)) {
            gate.metrics().inc_deduplicated();
            debug!(id, dedup_key, %priority, "joined in-flight request");
            return Submission { id: Some(*id), deduplicated: true, outcome: outcome.clone() };
        }

        if let Err(err) = gate.precheck_at(time::now()) {
            return Submission::rejected(err);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, receiver) = oneshot::channel();
        let outcome: SharedOutcome<T> = receiver.map(|received| received.unwrap_or(Err(GovernorError::Abandoned))).boxed().shared();

        if let Some(key) = dedup_key {
            state.dedup.insert(key.to_owned(), (id, outcome.clone()));
        }
        state.queue.push(
            priority,
            Request { id, dedup_key: dedup_key.map(str::to_owned), call: Box::new(move || call().boxed()), enqueued_at: time::now(), completion },
        );
        let depth = state.queue.len();
        drop(state);

        gate.metrics().inc_queued();
        debug!(id, %priority, depth, "request queued");
        gate.wake();

        Submission { id: Some(id), deduplicated: false, outcome }
    }

    /// Make one upstream call now, bypassing the queue
    ///
    /// The call still passes the cooldown, quota and breaker checks and waits
    /// for its dual limiter slot.
    pub async fn execute<R, F, Fut>(&self, priority: Priority, call: F) -> Outcome<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let gate = &self.inner.gate;
        if !self.is_running() {
            return Err(GovernorError::Shutdown);
        }

        gate.metrics().inc_direct_executes();
        let attempt = gate.admit()?;
        let slot = gate.limiter().reserve(priority.spacing_factor());
        DualLimiter::wait_for(slot).await;

        attempt.run(call).await
    }

    /// Check `identifier` against a named per-identifier rule
    pub fn check_rate(&self, rule: &str, identifier: &str) -> Outcome<()> {
        self.inner.gate.check_rate_at(rule, identifier, time::now())
    }

    /// Pause all upstream calls, for `duration` or the configured default
    pub fn signal_rate_limited(&self, duration: Option<Duration>) -> Duration {
        let duration = self.inner.gate.signal_rate_limited(duration);
        self.inner.gate.wake();
        duration
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.inner.gate.cooldown().remaining()
    }

    /// Drop per-identifier limiter state that has been idle too long
    pub fn evict_idle(&self) -> usize {
        self.inner.gate.evict_idle_at(time::now())
    }

    pub fn status(&self) -> GovernorStatus {
        let gate = &self.inner.gate;
        let now = time::now();

        let quota = gate.quota().snapshot();
        let breaker = gate.breaker().state();
        let usage = gate.limiter().usage_at(now);
        let (queue_depths, queued_total) = {
            let state = self.inner.state.lock();
            (state.queue.depths(), state.queue.len())
        };

        GovernorStatus {
            quota_used: quota.used,
            quota_limit: quota.limit,
            quota_remaining: quota.remaining,
            quota_reset_at: quota.reset_at.unix_timestamp(),
            time_until_reset: quota.time_until_reset,
            breaker_state: breaker.kind(),
            breaker_retry_in: gate.breaker().retry_in_at(now),
            queue_depths,
            queued_total,
            cooldown_remaining: gate.cooldown().remaining_at(now),
            upstream_calls_last_second: usage.last_second,
            upstream_calls_in_burst_window: usage.burst_window,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.gate.metrics().snapshot()
    }

    /// Cancel every queued request with `QueueCleared` and empty the dedup cache
    ///
    /// Requests already dispatched run to completion. Returns how many were cancelled.
    pub fn clear(&self) -> usize {
        let cleared = self.inner.cancel_queued(GovernorError::QueueCleared, true);
        self.inner.gate.metrics().add_cleared(cleared as u64);
        warn!(cleared, "request queue cleared");
        cleared
    }

    /// Stop the dispatcher and resolve every queued request with `Shutdown`
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.inner.state.lock().closed = true;
        let cancelled = self.inner.cancel_queued(GovernorError::Shutdown, false);
        self.inner.gate.wake();
        info!(cancelled, "governor shut down");
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Resolve every queued request with `error`, returning how many there were
    fn cancel_queued(&self, error: GovernorError, clear_dedup: bool) -> usize {
        let drained = {
            let mut state = self.state.lock();
            let drained = state.queue.drain();
            if clear_dedup {
                state.dedup.clear();
            } else {
                for request in &drained {
                    if let Some(key) = &request.dedup_key {
                        if state.dedup.get(key).is_some_and(|(owner, _)| *owner == request.id) {
                            state.dedup.remove(key);
                        }
                    }
                }
            }
            drained
        };

        let count = drained.len();
        for request in drained {
            let _ = request.completion.send(Err(error.clone()));
        }
        count
    }

    /// One dispatcher iteration: release the head request if the gate allows
    fn step(self: &Arc<Self>) -> Step {
        let gate = &self.gate;
        let now = time::now();

        let Some(head) = self.state.lock().queue.peek_priority() else {
            return Step::Idle(None);
        };

        match gate.hold_at(now) {
            Some(Hold::Cooldown(remaining)) => return Step::Idle(Some(remaining)),
            Some(Hold::Quota) => {
                let rejected = self.cancel_queued(GovernorError::QuotaExceeded { reason: QuotaReason::DailyQuota }, false);
                for _ in 0..rejected {
                    gate.metrics().inc_quota_exceeded();
                }
                warn!(rejected, "daily quota exhausted, queued requests rejected");
                return Step::Idle(None);
            }
            None => {}
        }

        // Keep the request queued, and re-orderable, until its slot is near
        let delay = gate.limiter().delay_at(now, head.spacing_factor());
        let lookahead = self.dispatcher.lookahead();
        if delay > lookahead {
            return Step::Idle(Some(delay - lookahead));
        }

        let Some(attempt) = gate.claim_at(now) else {
            return Step::Idle(gate.breaker().retry_in_at(now));
        };

        let Some((priority, request)) = self.state.lock().queue.pop() else {
            return Step::Idle(None);
        };

        let slot = gate.limiter().reserve_at(now, priority.spacing_factor());
        let Request { id, dedup_key, call, enqueued_at, completion } = request;
        debug!(id, %priority, queued_for = ?now.saturating_duration_since(enqueued_at), wait = ?time::until(slot, now), "request dispatched");

        let guard = DedupGuard { inner: Arc::downgrade(self), key: dedup_key, id };
        tokio::spawn(async move {
            DualLimiter::wait_for(slot).await;
            let outcome = attempt.run(call).await;

            drop(guard);
            let _ = completion.send(outcome);
        });

        Step::Dispatched
    }
}

async fn run_dispatcher<T: Clone + Send + Sync + 'static>(inner: Weak<Inner<T>>) {
    debug!("dispatcher loop started");

    loop {
        let Some(strong) = inner.upgrade() else { break };
        if !strong.running.load(Ordering::Acquire) {
            break;
        }

        let gate = Arc::clone(&strong.gate);
        let idle_poll = strong.dispatcher.idle_poll();

        // Registered before the step so a wake during it is not lost
        let notified = gate.notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = strong.step();
        drop(strong);

        match step {
            Step::Dispatched => tokio::task::yield_now().await,
            Step::Idle(hint) => {
                let wait = hint.map_or(idle_poll, |hint| hint.min(idle_poll)).max(Duration::from_millis(1));
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    debug!("dispatcher loop stopped");
}

async fn run_eviction_sweep<T: Clone + Send + Sync + 'static>(inner: Weak<Inner<T>>) {
    let period = match inner.upgrade() {
        Some(inner) => (inner.gate.idle_eviction() / 4).clamp(Duration::from_secs(1), time::MAX_HORIZON),
        None => return,
    };

    let mut interval = tokio::time::interval_at(time::after(time::now(), period), period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let Some(inner) = inner.upgrade() else { break };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        inner.gate.evict_idle_at(time::now());
    }
}
