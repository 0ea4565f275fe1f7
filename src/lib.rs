//! # Spread Scanner
//!
//! A concurrent market-scanning service for the vertical spread trading
//! stack. Accepts batches of symbols over HTTP, fetches historical bars per
//! symbol with bounded parallelism, evaluates trading strategies, caches
//! fetched series, and exposes operational metrics.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, validation, and hot reload
//! - `provider`: Historical market-data providers (mock, vendor, caching)
//! - `metrics`: Rolling-window metric tracker and Prometheus exposition
//! - `scanner`: The scan/bulk-fetch orchestrator and strategy rules
//! - `server`: HTTP surface and graceful shutdown

pub mod config;
pub mod metrics;
pub mod provider;
pub mod scanner;
pub mod server;

pub use config::Config;
pub use scanner::ScannerService;
