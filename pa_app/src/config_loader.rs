use std::path::Path;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use pa_governor::GovernorConfig;
use serde::Deserialize;
use serde::Serialize;

use crate::upstream::SimulationConfig;

/// Environment variables with this prefix override file values,
/// e.g. `PA_GATE__QUOTA__DAILY_LIMIT=500`
pub const ENV_PREFIX: &str = "PA_GATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub governor: GovernorConfig,
    pub simulation: SimulationConfig,
    /// How often the status reporter logs a snapshot
    pub status_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { governor: GovernorConfig::default(), simulation: SimulationConfig::default(), status_interval_ms: 10_000 }
    }
}

fn environment(source: Option<config::Map<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true).source(source)
}

fn load_with_env<P: AsRef<Path>>(path: P, env: Option<config::Map<String, String>>) -> Result<AppConfig, ConfigError> {
    let config = Config::builder().add_source(File::from(path.as_ref())).add_source(environment(env)).build()?;

    config.try_deserialize()
}

/// Load the gate configuration from a TOML file plus environment overrides
pub fn load_app_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    load_with_env(path, None)
}

/// Load the gate configuration with fallback to defaults
pub fn load_app_config_or_default(path: &str) -> AppConfig {
    match load_app_config(path) {
        Ok(config) => {
            tracing::info!("Loaded gate config from {path}");
            config
        }
        Err(err) => {
            tracing::warn!("Failed to load gate config from {}: {}. Using defaults.", path, err);
            AppConfig::default()
        }
    }
}
