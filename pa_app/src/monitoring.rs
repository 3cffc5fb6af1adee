use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pa_governor::Governor;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing::warn;

/// One JSON line with the governor's status and metrics
pub fn status_report<T: Clone + Send + Sync + 'static>(governor: &Governor<T>) -> serde_json::Result<String> {
    let report = serde_json::json!({
        "status": governor.status(),
        "metrics": governor.metrics(),
    });
    serde_json::to_string(&report)
}

/// Spawns a task that logs a status report every `interval` until `running` clears
pub fn spawn_status_reporter<T: Clone + Send + Sync + 'static>(governor: Governor<T>, interval: Duration, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while running.load(Ordering::Relaxed) {
            ticker.tick().await;

            match status_report(&governor) {
                Ok(report) => info!("Gate status: {report}"),
                Err(err) => warn!("Failed to serialise gate status: {err}"),
            }
        }

        info!("Status reporter stopped");
    })
}
