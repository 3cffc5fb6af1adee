use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Sets up a Ctrl+C handler that clears the running flag on shutdown signal
pub fn setup(running: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if running.swap(false, Ordering::Relaxed) {
            tracing::info!("Shutdown signal received");
        } else {
            tracing::warn!("Shutdown already in progress");
        }
    })
}
