use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pa_app::cli;
use pa_app::config_loader;
use pa_app::monitoring;
use pa_app::shutdown_handler;
use pa_app::upstream::ProductInfo;
use pa_app::upstream::SimulatedUpstream;
use pa_governor::Governor;
use pa_governor::GovernorError;
use pa_governor::Priority;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Simulated users sharing the per-identifier limits
const USERS: [&str; 3] = ["alice", "bob", "carol"];

fn log_outcome(kind: &str, asin: &str, outcome: &Result<ProductInfo, GovernorError>) {
    match outcome {
        Ok(product) => debug!("{kind} {asin}: {} cents", product.price_cents),
        Err(err) if err.is_quota_exceeded() || err.is_circuit_open() => warn!("{kind} {asin} refused: {err}"),
        Err(err) => info!("{kind} {asin} failed: {err}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = cli::from_env();

    // CRITICAL: Keep guard alive for entire application lifetime
    let _guard = if args.quiet {
        pa_app::tracing_setup::init("pa_gate", "./logs", tracing::Level::INFO)
    } else {
        pa_app::tracing_setup::init_with_stdout("pa_gate", "./logs", tracing::Level::INFO)
    };

    let config = config_loader::load_app_config_or_default(&args.config_path);
    info!(
        "Starting pa_gate: daily_limit={}, sustained_interval={}ms, burst={}/{}ms",
        config.governor.quota.daily_limit,
        config.governor.upstream.sustained_interval_ms,
        config.governor.upstream.burst_capacity,
        config.governor.upstream.burst_window_ms
    );

    let governor: Governor<ProductInfo> = Governor::start(&config.governor)?;
    let upstream = Arc::new(SimulatedUpstream::new(config.simulation.clone()));

    let running = Arc::new(AtomicBool::new(true));
    shutdown_handler::setup(Arc::clone(&running))?;

    let reporter = monitoring::spawn_status_reporter(governor.clone(), Duration::from_millis(config.status_interval_ms), Arc::clone(&running));

    let started = Instant::now();
    let request_interval = Duration::from_millis(config.simulation.request_interval_ms.max(1));
    let rule = config.governor.limits.rules.keys().next().cloned();
    let asins = config.simulation.asins.clone();
    let mut tick: usize = 0;

    while running.load(Ordering::Relaxed) {
        if args.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Run time elapsed, stopping");
            running.store(false, Ordering::Relaxed);
            break;
        }

        let Some(asin) = asins.get(tick % asins.len().max(1)).cloned() else {
            warn!("No products configured, nothing to request");
            break;
        };
        let user = USERS[tick % USERS.len()];
        let priority = Priority::ALL[tick % Priority::COUNT];
        // Every other round sends its user request straight through
        let direct = priority == Priority::UserTriggered && (tick / Priority::COUNT) % 2 == 1;
        tick += 1;

        if let Some(rule) = &rule {
            if let Err(err) = governor.check_rate(rule, user) {
                debug!("{user} held back by {rule}: {err}");
                tokio::time::sleep(request_interval).await;
                continue;
            }
        }

        if direct {
            let governor = governor.clone();
            let upstream = Arc::clone(&upstream);
            tokio::spawn(async move {
                let outcome = governor.execute(priority, || upstream.get_item(&asin)).await;
                log_outcome("execute", &asin, &outcome);
            });
        } else {
            let call_upstream = Arc::clone(&upstream);
            let call_asin = asin.clone();
            let submission = governor.submit(priority, Some(&asin), move || async move { call_upstream.get_item(&call_asin).await });
            if submission.is_deduplicated() {
                debug!("{asin} joined request {:?}", submission.id());
            }
            tokio::spawn(async move {
                let outcome = submission.await;
                log_outcome("submit", &asin, &outcome);
            });
        }

        tokio::time::sleep(request_interval).await;
    }

    let cleared = governor.clear();
    governor.shutdown();
    if let Err(err) = reporter.await {
        warn!("Status reporter task failed: {err}");
    }

    info!("Final gate status: {}", monitoring::status_report(&governor)?);
    info!("pa_gate stopped after {:?}, {} upstream calls, {cleared} requests cleared", started.elapsed(), upstream.calls());

    Ok(())
}
