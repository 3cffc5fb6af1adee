use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::bail;
use pa_governor::UpstreamThrottled;
use serde::Deserialize;
use serde::Serialize;

/// Behaviour of the simulated product-data API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Latency of every simulated call
    pub latency_ms: u64,
    /// Every Nth call answers with an explicit throttling response (0 = never)
    pub throttle_every: u64,
    /// Every Nth call fails with a server error (0 = never)
    pub fail_every: u64,
    /// Pause between generated workload requests
    pub request_interval_ms: u64,
    /// Product ids the workload cycles through, repeats get deduplicated
    pub asins: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_ms: 250,
            throttle_every: 0,
            fail_every: 25,
            request_interval_ms: 400,
            asins: vec!["B07XJ8C8F5".into(), "B08N5WRWNW".into(), "B09G9FPHY6".into(), "B0BSHF7WHW".into()],
        }
    }
}

/// Product data returned by the upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductInfo {
    pub asin: String,
    pub title: String,
    pub price_cents: u64,
}

/// In-process stand-in for the rate-limited product-data API
pub struct SimulatedUpstream {
    config: SimulationConfig,
    calls: AtomicU64,
}

impl SimulatedUpstream {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config, calls: AtomicU64::new(0) }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Look up one product
    pub async fn get_item(&self, asin: &str) -> anyhow::Result<ProductInfo> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;

        if is_nth(call, self.config.throttle_every) {
            return Err(UpstreamThrottled { retry_after: Some(Duration::from_secs(10)) }.into());
        }
        if is_nth(call, self.config.fail_every) {
            bail!("upstream returned HTTP 503 for {asin}");
        }

        // Stable fake price per product
        let price_cents = asin.bytes().map(u64::from).sum::<u64>() * 7 % 20_000 + 499;
        Ok(ProductInfo { asin: asin.to_string(), title: format!("Product {asin}"), price_cents })
    }
}

#[inline(always)]
fn is_nth(call: u64, every: u64) -> bool {
    every != 0 && call % every == 0
}
