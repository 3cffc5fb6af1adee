//! # pa_app
//!
//! Process wiring for the product-data API gate: logging, configuration,
//! shutdown signalling, status reporting and a simulated upstream.

pub mod cli;
pub mod config_loader;
pub mod monitoring;
pub mod shutdown_handler;
pub mod tracing_setup;
pub mod upstream;
