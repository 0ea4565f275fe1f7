//! The scanner service orchestrator.
//!
//! Executes batch scan and bulk-fetch requests with bounded per-symbol
//! parallelism, per-symbol deadline enforcement, failure isolation, and
//! metrics capture. Configuration is live-reloadable: in-flight calls keep
//! the snapshot, semaphore, and cache they started with; new calls pick up
//! the replacements.

use crate::config::{Config, ConfigHandle};
use crate::metrics::{MetricTracker, MetricsSnapshot};
use crate::provider::{self, DataProvider};
use crate::scanner::strategy::Strategy;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

/// Call-level failures. Per-symbol failures never surface here; they are
/// recorded in metrics and omitted from the result instead.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The caller's overall deadline elapsed. All partial results are
    /// discarded; the call fails atomically.
    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

/// Inclusive date range for historical data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub symbols: Vec<String>,
    pub strategies: Vec<String>,
    pub date_range: DateRange,
    /// Optional overall call deadline in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    /// Signals per symbol; only symbols that produced at least one signal
    /// appear, so the key set is a subset of the requested symbols.
    pub signals: HashMap<String, Vec<String>>,
    pub scan_time_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFetchRequest {
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFetchResponse {
    /// Serialized series per symbol; failed symbols are omitted.
    pub data: HashMap<String, Vec<u8>>,
    pub fetch_time_seconds: f64,
}

/// The concurrent market-scanning service.
pub struct ScannerService {
    config: ConfigHandle,
    config_path: Option<PathBuf>,
    provider: RwLock<Arc<dyn DataProvider>>,
    semaphore: RwLock<Arc<Semaphore>>,
    metrics: Arc<MetricTracker>,
    /// Serializes reloads; scan/fetch calls never take it.
    reload_lock: tokio::sync::Mutex<()>,
}

impl ScannerService {
    /// Build a service from a validated configuration. `config_path` is
    /// remembered as the reload source; without one, reloads fall back to
    /// environment variables and defaults.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricTracker::new()?);
        let data_provider = provider::build_provider(&config, metrics.clone())?;
        let semaphore = Arc::new(Semaphore::new(config.scanner.max_concurrency));

        Ok(Self {
            config: ConfigHandle::new(config),
            config_path,
            provider: RwLock::new(data_provider),
            semaphore: RwLock::new(semaphore),
            metrics,
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build a service around an externally supplied provider, bypassing the
    /// factory. The cache decorator is not applied.
    pub fn with_provider(config: Config, data_provider: Arc<dyn DataProvider>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricTracker::new()?);
        let semaphore = Arc::new(Semaphore::new(config.scanner.max_concurrency));

        Ok(Self {
            config: ConfigHandle::new(config),
            config_path: None,
            provider: RwLock::new(data_provider),
            semaphore: RwLock::new(semaphore),
            metrics,
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Evaluate the requested strategies against every symbol in the batch.
    ///
    /// Per-symbol fetch failures are isolated: the symbol is omitted and the
    /// error counter incremented, while the batch succeeds. An elapsed
    /// `deadline_ms` fails the whole call with [`ScanError::DeadlineExceeded`]
    /// and discards partial results.
    #[instrument(skip(self, request), fields(symbols = request.symbols.len()))]
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResponse, ScanError> {
        validate_batch(&request.symbols, &request.date_range)?;
        let deadline = request.deadline_ms.map(Duration::from_millis);

        match deadline {
            Some(limit) => timeout(limit, self.scan_inner(request))
                .await
                .map_err(|_| ScanError::DeadlineExceeded),
            None => Ok(self.scan_inner(request).await),
        }
    }

    async fn scan_inner(&self, request: ScanRequest) -> ScanResponse {
        let started = Instant::now();
        let symbol_count = request.symbols.len();

        // Snapshot the moving parts once; a concurrent reload affects only
        // calls that start after it.
        let config = self.config.current();
        let semaphore = self.current_semaphore();
        let data_provider = self.current_provider();
        let symbol_timeout = config.symbol_timeout();

        let strategies = Arc::new(resolve_strategies(&request.strategies));
        let signals: Arc<Mutex<HashMap<String, Vec<String>>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(symbol_count)));

        let mut tasks = JoinSet::new();
        let DateRange { start, end } = request.date_range;

        for symbol in request.symbols {
            let semaphore = semaphore.clone();
            let data_provider = data_provider.clone();
            let strategies = strategies.clone();
            let signals = signals.clone();
            let metrics = self.metrics.clone();

            tasks.spawn(async move {
                // Blocks until a pool slot frees; the permit is held for the
                // fetch and the strategy evaluation, then released on drop.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("scan semaphore is never closed");

                let series = match timeout(
                    symbol_timeout,
                    data_provider.get_historical_data(&symbol, start, end),
                )
                .await
                {
                    Ok(Ok(series)) => series,
                    Ok(Err(e)) => {
                        error!(symbol, error = %e, "Failed to fetch data");
                        metrics.increment_error_count();
                        return;
                    }
                    Err(_) => {
                        error!(symbol, timeout_ms = symbol_timeout.as_millis() as u64, "Fetch timed out");
                        metrics.increment_error_count();
                        return;
                    }
                };

                // Evaluate all requested strategies for this symbol concurrently
                let evaluations = join_all(strategies.iter().map(|strategy| {
                    let series = &series;
                    async move { strategy.evaluate(series) }
                }))
                .await;

                let symbol_signals: Vec<String> = evaluations
                    .into_iter()
                    .flatten()
                    .map(|signal| signal.to_string())
                    .collect();

                if !symbol_signals.is_empty() {
                    signals
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(symbol, symbol_signals);
                }
            });
        }

        // Wait for the whole batch; completion order across symbols is
        // irrelevant since results are keyed by symbol.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Scan worker task failed");
                self.metrics.increment_error_count();
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_scan(symbol_count, elapsed);

        let signals = std::mem::take(
            &mut *signals
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        info!(
            symbols = symbol_count,
            signaled = signals.len(),
            elapsed_secs = elapsed,
            "Scan complete"
        );

        ScanResponse {
            signals,
            scan_time_seconds: elapsed,
        }
    }

    /// Fetch and serialize historical data for every symbol in the batch,
    /// under the same pool, timeout, and failure-isolation discipline as
    /// [`scan`](Self::scan). Serialization failures are treated exactly like
    /// fetch failures.
    #[instrument(skip(self, request), fields(symbols = request.symbols.len()))]
    pub async fn bulk_fetch(
        &self,
        request: BulkFetchRequest,
    ) -> Result<BulkFetchResponse, ScanError> {
        validate_batch(&request.symbols, &request.date_range)?;
        let deadline = request.deadline_ms.map(Duration::from_millis);

        match deadline {
            Some(limit) => timeout(limit, self.fetch_inner(request))
                .await
                .map_err(|_| ScanError::DeadlineExceeded),
            None => Ok(self.fetch_inner(request).await),
        }
    }

    async fn fetch_inner(&self, request: BulkFetchRequest) -> BulkFetchResponse {
        let started = Instant::now();
        let symbol_count = request.symbols.len();

        let config = self.config.current();
        let semaphore = self.current_semaphore();
        let data_provider = self.current_provider();
        let symbol_timeout = config.symbol_timeout();

        let data: Arc<Mutex<HashMap<String, Vec<u8>>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(symbol_count)));

        let mut tasks = JoinSet::new();
        let DateRange { start, end } = request.date_range;

        for symbol in request.symbols {
            let semaphore = semaphore.clone();
            let data_provider = data_provider.clone();
            let data = data.clone();
            let metrics = self.metrics.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("fetch semaphore is never closed");

                let series = match timeout(
                    symbol_timeout,
                    data_provider.get_historical_data(&symbol, start, end),
                )
                .await
                {
                    Ok(Ok(series)) => series,
                    Ok(Err(e)) => {
                        error!(symbol, error = %e, "Failed to fetch data");
                        metrics.increment_error_count();
                        return;
                    }
                    Err(_) => {
                        error!(symbol, "Fetch timed out");
                        metrics.increment_error_count();
                        return;
                    }
                };

                match serde_json::to_vec(&series) {
                    Ok(serialized) => {
                        data.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(symbol, serialized);
                    }
                    Err(e) => {
                        error!(symbol, error = %e, "Failed to serialize data");
                        metrics.increment_error_count();
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Fetch worker task failed");
                self.metrics.increment_error_count();
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_fetch(symbol_count, elapsed);

        let data = std::mem::take(
            &mut *data
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        info!(
            symbols = symbol_count,
            fetched = data.len(),
            elapsed_secs = elapsed,
            "Bulk fetch complete"
        );

        BulkFetchResponse {
            data,
            fetch_time_seconds: elapsed,
        }
    }

    /// Point-in-time aggregated metrics. Pure read, always succeeds.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of the service metrics.
    pub fn encode_prometheus(&self) -> Result<String> {
        self.metrics.encode_prometheus()
    }

    /// The active configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.current()
    }

    /// Re-read the configuration and swap it in atomically.
    ///
    /// The cache is rebuilt with the new TTL and the worker pool replaced;
    /// both take effect for calls that start after the reload, while
    /// in-flight calls finish under what they captured at entry. On failure
    /// the previous configuration stays active.
    pub async fn reload_config(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let new_config = match &self.config_path {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("reload from {}", path.display()))?,
            None => Config::load().context("reload from environment")?,
        };
        new_config.validate().context("reloaded config invalid")?;

        let new_provider = provider::build_provider(&new_config, self.metrics.clone())?;
        let new_semaphore = Arc::new(Semaphore::new(new_config.scanner.max_concurrency));

        *self
            .provider
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_provider;
        *self
            .semaphore
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_semaphore;

        info!(
            max_concurrency = new_config.scanner.max_concurrency,
            cache_ttl_secs = new_config.cache.ttl_secs,
            "Configuration reloaded"
        );
        self.config.swap(new_config);

        Ok(())
    }

    fn current_semaphore(&self) -> Arc<Semaphore> {
        self.semaphore
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn current_provider(&self) -> Arc<dyn DataProvider> {
        self.provider
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn validate_batch(symbols: &[String], range: &DateRange) -> Result<(), ScanError> {
    if symbols.is_empty() {
        return Err(ScanError::InvalidRequest("symbols list is empty".into()));
    }
    if range.start > range.end {
        return Err(ScanError::InvalidRequest(format!(
            "date range start {} is after end {}",
            range.start, range.end
        )));
    }
    Ok(())
}

/// Resolve strategy identifiers, skipping unknown ones with a warning.
fn resolve_strategies(ids: &[String]) -> Vec<Strategy> {
    ids.iter()
        .filter_map(|id| {
            let parsed = Strategy::parse(id);
            if parsed.is_none() {
                warn!(strategy = %id, "Ignoring unknown strategy identifier");
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Bar, MarketDataSeries};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(max_concurrency: usize) -> Config {
        let mut config = Config::default();
        config.scanner.max_concurrency = max_concurrency;
        config
    }

    fn range() -> DateRange {
        DateRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        }
    }

    fn ascending_series(symbol: &str) -> MarketDataSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let bars = (0..10)
            .map(|i| {
                let close = Decimal::new(100 + i, 0);
                Bar {
                    timestamp: (start + chrono::Duration::days(i))
                        .and_hms_opt(0, 0, 0)
                        .unwrap()
                        .and_utc(),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000,
                }
            })
            .collect();
        MarketDataSeries {
            symbol: symbol.to_string(),
            start,
            end: start + chrono::Duration::days(10),
            bars,
        }
    }

    /// Serves a rising series for every symbol except "BAD", which fails.
    /// Tracks peak in-flight calls so tests can assert the pool bound.
    struct ScriptedProvider {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn peak_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataProvider for ScriptedProvider {
        async fn get_historical_data(
            &self,
            symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<MarketDataSeries> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if symbol == "BAD" {
                anyhow::bail!("no data for symbol");
            }
            Ok(ascending_series(symbol))
        }
    }

    fn scan_request(symbols: &[&str], strategies: &[&str]) -> ScanRequest {
        ScanRequest {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            date_range: range(),
            deadline_ms: None,
        }
    }

    #[tokio::test]
    async fn test_empty_symbols_rejected() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let result = service.scan(scan_request(&[], &["HIGH_BASE"])).await;
        assert!(matches!(result, Err(ScanError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_inverted_date_range_rejected() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let mut request = scan_request(&["AAPL"], &["HIGH_BASE"]);
        request.date_range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let result = service.scan(request).await;
        assert!(matches!(result, Err(ScanError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_scan_isolates_symbol_failures() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let response = service
            .scan(scan_request(&["AAPL", "MSFT", "BAD"], &["HIGH_BASE"]))
            .await
            .unwrap();

        assert_eq!(response.signals.len(), 2);
        assert_eq!(response.signals["AAPL"], vec!["LONG"]);
        assert_eq!(response.signals["MSFT"], vec!["LONG"]);
        assert!(!response.signals.contains_key("BAD"));

        let snapshot = service.get_metrics();
        assert_eq!(snapshot.total_scans, 1);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_scan_respects_concurrency_bound() {
        let provider = ScriptedProvider::new(Duration::from_millis(20));
        let service = ScannerService::with_provider(test_config(2), provider.clone()).unwrap();

        let symbols: Vec<String> = (0..8).map(|i| format!("SYM{i}")).collect();
        let request = ScanRequest {
            symbols,
            strategies: vec!["HIGH_BASE".to_string()],
            date_range: range(),
            deadline_ms: None,
        };
        let response = service.scan(request).await.unwrap();

        assert_eq!(response.signals.len(), 8);
        assert!(provider.peak_in_flight() <= 2, "pool bound exceeded");
        assert!(provider.peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_unknown_strategies_are_skipped() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let response = service
            .scan(scan_request(&["AAPL"], &["HIGH_BASE", "IRON_CONDOR"]))
            .await
            .unwrap();

        assert_eq!(response.signals["AAPL"], vec!["LONG"]);
        assert_eq!(service.get_metrics().error_count, 0);
    }

    #[tokio::test]
    async fn test_deadline_discards_partial_results() {
        let provider = ScriptedProvider::new(Duration::from_millis(200));
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let mut request = scan_request(&["AAPL", "MSFT"], &["HIGH_BASE"]);
        request.deadline_ms = Some(20);
        let result = service.scan(request).await;

        assert!(matches!(result, Err(ScanError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_symbol_timeout_counts_as_error() {
        let provider = ScriptedProvider::new(Duration::from_millis(200));
        let mut config = test_config(2);
        config.scanner.symbol_timeout_ms = 10;
        let service = ScannerService::with_provider(config, provider).unwrap();

        let response = service
            .scan(scan_request(&["AAPL", "MSFT"], &["HIGH_BASE"]))
            .await
            .unwrap();

        assert!(response.signals.is_empty());
        assert_eq!(service.get_metrics().error_count, 2);
    }

    #[tokio::test]
    async fn test_bulk_fetch_serializes_per_symbol() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        let request = BulkFetchRequest {
            symbols: vec!["AAPL".to_string(), "BAD".to_string()],
            date_range: range(),
            deadline_ms: None,
        };
        let response = service.bulk_fetch(request).await.unwrap();

        assert_eq!(response.data.len(), 1);
        let series: MarketDataSeries = serde_json::from_slice(&response.data["AAPL"]).unwrap();
        assert_eq!(series.symbol, "AAPL");
        assert_eq!(series.len(), 10);

        let snapshot = service.get_metrics();
        assert_eq!(snapshot.total_fetches, 1);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_metrics_snapshot_is_pure_read() {
        let provider = ScriptedProvider::new(Duration::ZERO);
        let service = ScannerService::with_provider(test_config(2), provider).unwrap();

        service
            .scan(scan_request(&["AAPL"], &["HIGH_BASE"]))
            .await
            .unwrap();

        let first = service.get_metrics();
        let second = service.get_metrics();
        assert_eq!(first.total_scans, second.total_scans);
        assert_eq!(first.avg_scan_time_seconds, second.avg_scan_time_seconds);
    }

    fn write_config(dir: &str, max_concurrency: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scanner.toml");
        std::fs::write(
            &path,
            format!("[scanner]\nmax_concurrency = {max_concurrency}\n"),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_reload_swaps_configuration() {
        let path = write_config("spread-scanner-reload-test", 4);
        let config = Config::load_from(&path).unwrap();
        let service = ScannerService::new(config, Some(path.clone())).unwrap();
        assert_eq!(service.config().scanner.max_concurrency, 4);

        std::fs::write(&path, "[scanner]\nmax_concurrency = 2\n").unwrap();
        service.reload_config().await.unwrap();

        assert_eq!(service.config().scanner.max_concurrency, 2);
        assert_eq!(service.current_semaphore().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_active_configuration() {
        let path = write_config("spread-scanner-reload-invalid-test", 4);
        let config = Config::load_from(&path).unwrap();
        let service = ScannerService::new(config, Some(path.clone())).unwrap();

        // Zero concurrency fails validation
        std::fs::write(&path, "[scanner]\nmax_concurrency = 0\n").unwrap();
        assert!(service.reload_config().await.is_err());

        assert_eq!(service.config().scanner.max_concurrency, 4);
        assert_eq!(service.current_semaphore().available_permits(), 4);
    }
}
