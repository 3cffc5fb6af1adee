//! End-to-end scenarios for the governor
//!
//! Every test runs on a paused tokio clock, so limiter spacing, cooldowns and
//! breaker recovery play out in virtual time.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use pa_governor::BreakerStateKind;
use pa_governor::Gate;
use pa_governor::Governor;
use pa_governor::GovernorConfig;
use pa_governor::GovernorError;
use pa_governor::Priority;
use pa_governor::UpstreamThrottled;
use pa_governor::config::RuleConfig;
use pa_governor::config::StrategyKind;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Limiter wide open: no spacing, no practical burst cap
fn open_config() -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.upstream.sustained_interval_ms = 0;
    config.upstream.burst_capacity = 10_000;
    config
}

#[tokio::test(start_paused = true)]
async fn test_priority_ordering() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 100;
    let governor = Governor::<Priority>::start(&config).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let submissions: Vec<_> = [Priority::Analytics, Priority::UserTriggered, Priority::ActiveWatch]
        .into_iter()
        .map(|priority| {
            let order = Arc::clone(&order);
            governor.submit(priority, None, move || async move {
                order.lock().push(priority);
                Ok(priority)
            })
        })
        .collect();

    for result in join_all(submissions).await {
        result.unwrap();
    }

    assert_eq!(*order.lock(), vec![Priority::UserTriggered, Priority::ActiveWatch, Priority::Analytics]);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_within_priority() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 100;
    let governor = Governor::<usize>::start(&config).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let submissions: Vec<_> = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            governor.submit(Priority::BackgroundEnrichment, None, move || async move {
                order.lock().push(i);
                Ok(i)
            })
        })
        .collect();
    join_all(submissions).await;

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_deduplication() {
    let governor = Governor::<String>::start(&open_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let make_call = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, anyhow::Error>("B00TEST01: 19.99".to_string())
        }
    };

    let first = governor.submit(Priority::ActiveWatch, Some("asin:B00TEST01"), make_call(Arc::clone(&calls)));
    let second = governor.submit(Priority::UserTriggered, Some("asin:B00TEST01"), make_call(Arc::clone(&calls)));

    assert!(!first.is_deduplicated());
    assert!(second.is_deduplicated());
    assert_eq!(first.id(), second.id());

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), "B00TEST01: 19.99");
    assert_eq!(b.unwrap(), "B00TEST01: 19.99");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = governor.metrics();
    assert_eq!(metrics.deduplicated_count, 1);
    assert_eq!(metrics.queued_count, 1);
    assert_eq!(metrics.processed_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deduplicated_waiters_share_failure() {
    let governor = Governor::<()>::start(&open_config()).unwrap();

    let first = governor.submit(Priority::ActiveWatch, Some("search:headphones"), || async { Err(anyhow::anyhow!("HTTP 503")) });
    let second = governor.submit(Priority::ActiveWatch, Some("search:headphones"), || async { Ok(()) });

    let (a, b) = tokio::join!(first, second);
    for result in [a, b] {
        let err = result.unwrap_err();
        assert_eq!(err.upstream().map(|e| e.to_string()), Some("HTTP 503".to_string()));
    }

    // Breaker saw one failure, not one per waiter
    assert_eq!(governor.metrics().failed_count, 1);
    assert_eq!(governor.gate().breaker().counter(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_timing() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 1500;
    config.upstream.burst_capacity = 10;
    let governor = Governor::<()>::start(&config).unwrap();
    let invoked = Arc::new(Mutex::new(Vec::new()));

    let start = Instant::now();
    let mut submissions = Vec::new();
    for priority in [Priority::Analytics, Priority::UserTriggered, Priority::Analytics, Priority::UserTriggered, Priority::Analytics, Priority::UserTriggered] {
        let invoked = Arc::clone(&invoked);
        submissions.push(governor.submit(priority, None, move || async move {
            invoked.lock().push(priority);
            Ok(())
        }));
    }

    let results = join_all(submissions).await;
    let elapsed = start.elapsed();

    assert!(results.iter().all(Result::is_ok));
    assert!(elapsed >= Duration::from_millis(7500), "elapsed {elapsed:?}");

    let invoked = invoked.lock();
    assert_eq!(invoked.len(), 6);
    assert!(invoked[..3].iter().all(|p| *p == Priority::UserTriggered));
    assert!(invoked[3..].iter().all(|p| *p == Priority::Analytics));
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_cycle() {
    let mut config = open_config();
    config.breaker.failure_threshold = 2;
    config.breaker.recovery_timeout_ms = 60_000;
    let governor = Governor::<u32>::start(&config).unwrap();

    for _ in 0..2 {
        let err = governor.submit(Priority::ActiveWatch, None, || async { Err(anyhow::anyhow!("HTTP 500")) }).await.unwrap_err();
        assert!(err.upstream().is_some());
    }
    assert_eq!(governor.status().breaker_state, BreakerStateKind::Open);

    // Open: refused without reaching the upstream
    let refused = governor.submit(Priority::UserTriggered, None, || async { Ok(1) });
    assert_eq!(refused.id(), None);
    assert!(refused.await.unwrap_err().is_circuit_open());
    assert!(governor.execute(Priority::UserTriggered, || async { Ok(1) }).await.unwrap_err().is_circuit_open());

    tokio::time::advance(Duration::from_secs(60)).await;

    // Recovery probe closes the circuit
    assert_eq!(governor.submit(Priority::UserTriggered, None, || async { Ok(7) }).await.unwrap(), 7);
    assert_eq!(governor.status().breaker_state, BreakerStateKind::Closed);

    let metrics = governor.metrics();
    assert_eq!(metrics.breaker_activations, 1);
    assert_eq!(metrics.breaker_rejections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_releases_single_probe() {
    let mut config = open_config();
    config.breaker.failure_threshold = 1;
    config.breaker.recovery_timeout_ms = 10_000;
    let governor = Governor::<()>::start(&config).unwrap();
    let started = Arc::new(AtomicUsize::new(0));

    governor.submit(Priority::ActiveWatch, None, || async { Err(anyhow::anyhow!("timeout")) }).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(10)).await;

    let submissions: Vec<_> = (0..2)
        .map(|_| {
            let started = Arc::clone(&started);
            governor.submit(Priority::ActiveWatch, None, move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(governor.status().breaker_state, BreakerStateKind::HalfOpen);

    for result in join_all(submissions).await {
        result.unwrap();
    }
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(governor.status().breaker_state, BreakerStateKind::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion() {
    let mut config = open_config();
    config.quota.daily_limit = 2;
    let governor = Governor::<u32>::start(&config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let submissions: Vec<_> = (0..3)
        .map(|i| {
            let calls = Arc::clone(&calls);
            governor.submit(Priority::ActiveWatch, None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();
    let results = join_all(submissions).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert!(results[2].as_ref().unwrap_err().is_quota_exceeded());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let refused = governor.submit(Priority::UserTriggered, None, || async { Ok(9) });
    assert!(refused.await.unwrap_err().is_quota_exceeded());

    let status = governor.status();
    assert_eq!(status.quota_used, 2);
    assert_eq!(status.quota_remaining, 0);
    assert_eq!(governor.metrics().quota_exceeded_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_cancels_queued_requests() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 60_000;
    let governor = Governor::<()>::start(&config).unwrap();

    governor.submit(Priority::UserTriggered, None, || async { Ok(()) }).await.unwrap();

    let queued = vec![
        governor.submit(Priority::UserTriggered, Some("asin:B001"), || async { Ok(()) }),
        governor.submit(Priority::Analytics, None, || async { Ok(()) }),
        governor.submit(Priority::ActiveWatch, None, || async { Ok(()) }),
    ];
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(governor.status().queued_total, 3);

    assert_eq!(governor.clear(), 3);
    for result in join_all(queued).await {
        assert!(matches!(result, Err(GovernorError::QueueCleared)));
    }

    assert_eq!(governor.status().queued_total, 0);
    assert_eq!(governor.metrics().cleared_count, 3);

    // Dedup cache emptied with the queue
    let fresh = governor.submit(Priority::UserTriggered, Some("asin:B001"), || async { Ok(()) });
    assert!(!fresh.is_deduplicated());
}

#[tokio::test(start_paused = true)]
async fn test_throttled_upstream_triggers_cooldown() {
    let governor = Governor::<u32>::start(&open_config()).unwrap();

    let err = governor
        .submit(Priority::ActiveWatch, None, || async { Err(UpstreamThrottled { retry_after: Some(Duration::from_secs(5)) }.into()) })
        .await
        .unwrap_err();
    assert!(err.upstream().is_some_and(|e| e.is::<UpstreamThrottled>()));
    assert_eq!(governor.cooldown_remaining(), Some(Duration::from_secs(5)));

    assert!(matches!(governor.execute(Priority::UserTriggered, || async { Ok(1) }).await, Err(GovernorError::Cooldown { .. })));

    // Queued work waits out the cooldown
    let start = Instant::now();
    assert_eq!(governor.submit(Priority::UserTriggered, None, || async { Ok(2) }).await.unwrap(), 2);
    assert!(start.elapsed() >= Duration::from_secs(5), "elapsed {:?}", start.elapsed());
    assert_eq!(governor.metrics().cooldown_activations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_cooldown_signal() {
    let governor = Governor::<()>::start(&open_config()).unwrap();

    assert_eq!(governor.signal_rate_limited(None), Duration::from_secs(60));
    assert_eq!(governor.status().cooldown_remaining, Some(Duration::from_secs(60)));

    // A shorter signal keeps the running cooldown and is not counted again
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(governor.signal_rate_limited(Some(Duration::from_secs(5))), Duration::from_secs(50));
    assert_eq!(governor.metrics().cooldown_activations, 1);

    // A longer one extends it
    assert_eq!(governor.signal_rate_limited(Some(Duration::from_secs(55))), Duration::from_secs(55));
    assert_eq!(governor.metrics().cooldown_activations, 2);

    tokio::time::advance(Duration::from_secs(56)).await;
    assert_eq!(governor.cooldown_remaining(), None);
    governor.execute(Priority::Analytics, || async { Ok(()) }).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_execute_respects_spacing() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 1000;
    let governor = Governor::<()>::start(&config).unwrap();

    let start = Instant::now();
    governor.execute(Priority::ActiveWatch, || async { Ok(()) }).await.unwrap();
    governor.execute(Priority::ActiveWatch, || async { Ok(()) }).await.unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1010), "elapsed {elapsed:?}");
    assert_eq!(governor.metrics().direct_execute_count, 2);
    assert_eq!(governor.status().upstream_calls_last_second, 1);
}

#[tokio::test(start_paused = true)]
async fn test_check_rate() {
    let mut config = open_config();
    config.limits.rules.insert(
        "chat".into(),
        RuleConfig { strategy: StrategyKind::TokenBucket, capacity: 2, window_ms: None, refill_per_sec: Some(1.0), violation_threshold: 2, block_ms: 30_000 },
    );
    let governor = Governor::<()>::start(&config).unwrap();

    assert!(governor.check_rate("chat", "user-1").is_ok());
    assert!(governor.check_rate("chat", "user-1").is_ok());
    assert!(matches!(
        governor.check_rate("chat", "user-1"),
        Err(GovernorError::RateLimited { retry_after }) if retry_after == Duration::from_secs(1)
    ));

    // Second violation escalates into a block
    assert!(matches!(
        governor.check_rate("chat", "user-1"),
        Err(GovernorError::RateLimited { retry_after }) if retry_after == Duration::from_secs(30)
    ));

    // Other identifiers are unaffected
    assert!(governor.check_rate("chat", "user-2").is_ok());
    assert!(matches!(governor.check_rate("nope", "user-1"), Err(GovernorError::UnknownRule(_))));
    assert_eq!(governor.metrics().rate_limited_count, 2);
}

fn search_rule_config(idle_eviction_ms: u64) -> GovernorConfig {
    let mut config = open_config();
    config.limits.idle_eviction_ms = idle_eviction_ms;
    config.limits.rules.insert(
        "search".into(),
        RuleConfig { strategy: StrategyKind::SlidingWindow, capacity: 5, window_ms: Some(10_000), refill_per_sec: None, violation_threshold: 5, block_ms: 1000 },
    );
    config
}

#[test]
fn test_idle_limiter_state_evicted() {
    let gate = Gate::new(&search_rule_config(60_000)).unwrap();
    let now = Instant::now();

    for user in ["a", "b", "c"] {
        gate.check_rate_at("search", user, now).unwrap();
    }
    gate.check_rate_at("search", "d", now + Duration::from_secs(30)).unwrap();
    assert_eq!(gate.rules().tracked(), 4);

    assert_eq!(gate.evict_idle_at(now + Duration::from_secs(60)), 3);
    assert_eq!(gate.rules().tracked(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_evicts_idle_state() {
    let governor = Governor::<()>::start(&search_rule_config(60_000)).unwrap();

    for user in ["a", "b", "c"] {
        governor.check_rate("search", user).unwrap();
    }
    assert_eq!(governor.gate().rules().tracked(), 3);

    // Sweep runs every quarter of the idle age
    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(governor.gate().rules().tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 60_000;
    let governor = Governor::<()>::start(&config).unwrap();

    governor.submit(Priority::UserTriggered, None, || async { Ok(()) }).await.unwrap();
    let pending = governor.submit(Priority::Analytics, None, || async { Ok(()) });

    governor.shutdown();
    assert!(!governor.is_running());
    assert!(matches!(pending.await, Err(GovernorError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_governors_share_gate() {
    let mut config = open_config();
    config.upstream.sustained_interval_ms = 1000;
    let gate = Arc::new(Gate::new(&config).unwrap());

    let prices = Governor::<f64>::with_gate(Arc::clone(&gate), config.dispatcher.clone());
    let titles = Governor::<String>::with_gate(Arc::clone(&gate), config.dispatcher.clone());

    let start = Instant::now();
    let (price, title) = tokio::join!(
        prices.submit(Priority::ActiveWatch, None, || async { Ok(19.99) }),
        titles.submit(Priority::ActiveWatch, None, || async { Ok("Headphones".to_string()) }),
    );

    assert_eq!(price.unwrap(), 19.99);
    assert_eq!(title.unwrap(), "Headphones");
    // One limiter for both: the second call waited for the first's spacing
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(prices.metrics().processed_count, 2);
    assert_eq!(gate.quota().counter().used, 2);
}
