//! Operational metrics for the scanner service.
//!
//! [`MetricTracker`] accumulates scan/fetch durations in bounded rolling
//! windows behind a single mutex, so producers never block for long and the
//! tracker never grows without bound. Every record call also updates the
//! Prometheus instruments registered on the tracker's registry; the `/metrics`
//! endpoint renders them via the text encoder.

use anyhow::Result;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Number of recent samples kept per rolling window.
const WINDOW_SIZE: usize = 100;

/// Point-in-time aggregated metrics.
///
/// A value snapshot: reading it twice with no intervening activity yields
/// identical numbers apart from the resource gauges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Average scan duration over the rolling window, in seconds
    pub avg_scan_time_seconds: f64,
    /// Average bulk-fetch duration over the rolling window, in seconds
    pub avg_fetch_time_seconds: f64,
    /// Symbols processed per second across tracked scan samples
    pub symbols_per_second: f64,
    pub total_scans: u64,
    pub total_fetches: u64,
    pub error_count: u64,
    /// Cache hits as a percentage of cache requests (0 when none yet)
    pub cache_hit_rate_pct: f64,
    /// Resident set size of the process in megabytes (0 off Linux)
    pub memory_usage_mb: f64,
    /// Process CPU usage percent since the previous sample (0 off Linux
    /// and on the first sample)
    pub cpu_usage_pct: f64,
}

/// One rolling window of (symbol count, duration) samples.
#[derive(Debug, Default)]
struct RollingWindow {
    samples: VecDeque<(usize, f64)>,
}

impl RollingWindow {
    fn push(&mut self, symbol_count: usize, seconds: f64) {
        if self.samples.len() >= WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back((symbol_count, seconds));
    }

    fn avg_seconds(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = self.samples.iter().map(|(_, secs)| secs).sum();
        total / self.samples.len() as f64
    }

    /// Total symbols divided by total time across the window.
    fn throughput(&self) -> f64 {
        let total_secs: f64 = self.samples.iter().map(|(_, secs)| secs).sum();
        if total_secs == 0.0 {
            return 0.0;
        }
        let total_symbols: usize = self.samples.iter().map(|(count, _)| count).sum();
        total_symbols as f64 / total_secs
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    scans: RollingWindow,
    fetches: RollingWindow,
    total_scans: u64,
    total_fetches: u64,
    total_symbols: u64,
    error_count: u64,
    cache_hits: u64,
    cache_requests: u64,
}

impl TrackerState {
    fn cache_hit_rate_pct(&self) -> f64 {
        if self.cache_requests == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.cache_requests as f64 * 100.0
    }
}

struct PromInstruments {
    scan_duration: Histogram,
    fetch_duration: Histogram,
    scan_total: Counter,
    fetch_total: Counter,
    errors_total: Counter,
    symbols_total: Counter,
    symbols_per_second: Gauge,
    cache_hit_rate: Gauge,
    memory_usage_bytes: Gauge,
    cpu_usage_percent: Gauge,
}

/// Thread-safe accumulator of scan/fetch durations, counts, error counts,
/// and cache hit ratios.
pub struct MetricTracker {
    state: Mutex<TrackerState>,
    prom: PromInstruments,
    registry: Registry,
    cpu: CpuTracker,
}

impl MetricTracker {
    /// Create a tracker with all Prometheus instruments registered on a
    /// fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scan_duration = Histogram::with_opts(
            HistogramOpts::new("scanner_scan_duration_seconds", "Duration of scan operations")
                .buckets(prometheus::exponential_buckets(0.01, 2.0, 10)?),
        )?;
        registry.register(Box::new(scan_duration.clone()))?;

        let fetch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "scanner_fetch_duration_seconds",
                "Duration of bulk fetch operations",
            )
            .buckets(prometheus::exponential_buckets(0.01, 2.0, 10)?),
        )?;
        registry.register(Box::new(fetch_duration.clone()))?;

        let scan_total = Counter::with_opts(Opts::new(
            "scanner_scan_total",
            "Total number of scan operations",
        ))?;
        registry.register(Box::new(scan_total.clone()))?;

        let fetch_total = Counter::with_opts(Opts::new(
            "scanner_fetch_total",
            "Total number of bulk fetch operations",
        ))?;
        registry.register(Box::new(fetch_total.clone()))?;

        let errors_total = Counter::with_opts(Opts::new(
            "scanner_errors_total",
            "Total number of per-symbol errors",
        ))?;
        registry.register(Box::new(errors_total.clone()))?;

        let symbols_total = Counter::with_opts(Opts::new(
            "scanner_symbols_total",
            "Total number of symbols scanned",
        ))?;
        registry.register(Box::new(symbols_total.clone()))?;

        let symbols_per_second = Gauge::with_opts(Opts::new(
            "scanner_symbols_per_second",
            "Rate of symbols scanned per second",
        ))?;
        registry.register(Box::new(symbols_per_second.clone()))?;

        let cache_hit_rate = Gauge::with_opts(Opts::new(
            "scanner_cache_hit_rate",
            "Cache hit rate percentage",
        ))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;

        let memory_usage_bytes = Gauge::with_opts(Opts::new(
            "scanner_memory_usage_bytes",
            "Resident memory usage in bytes",
        ))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;

        let cpu_usage_percent = Gauge::with_opts(Opts::new(
            "scanner_cpu_usage_percent",
            "Process CPU usage percentage",
        ))?;
        registry.register(Box::new(cpu_usage_percent.clone()))?;

        Ok(Self {
            state: Mutex::new(TrackerState::default()),
            prom: PromInstruments {
                scan_duration,
                fetch_duration,
                scan_total,
                fetch_total,
                errors_total,
                symbols_total,
                symbols_per_second,
                cache_hit_rate,
                memory_usage_bytes,
                cpu_usage_percent,
            },
            registry,
            cpu: CpuTracker::default(),
        })
    }

    /// Record one completed scan call.
    pub fn record_scan(&self, symbol_count: usize, seconds: f64) {
        let mut state = self.lock_state();
        state.scans.push(symbol_count, seconds);
        state.total_scans += 1;
        state.total_symbols += symbol_count as u64;
        let throughput = state.scans.throughput();
        drop(state);

        self.prom.scan_duration.observe(seconds);
        self.prom.scan_total.inc();
        self.prom.symbols_total.inc_by(symbol_count as f64);
        self.prom.symbols_per_second.set(throughput);
    }

    /// Record one completed bulk-fetch call.
    pub fn record_fetch(&self, symbol_count: usize, seconds: f64) {
        let mut state = self.lock_state();
        state.fetches.push(symbol_count, seconds);
        state.total_fetches += 1;
        drop(state);

        self.prom.fetch_duration.observe(seconds);
        self.prom.fetch_total.inc();
    }

    pub fn record_cache_hit(&self) {
        let mut state = self.lock_state();
        state.cache_hits += 1;
        state.cache_requests += 1;
        let rate = state.cache_hit_rate_pct();
        drop(state);

        self.prom.cache_hit_rate.set(rate);
    }

    pub fn record_cache_miss(&self) {
        let mut state = self.lock_state();
        state.cache_requests += 1;
        let rate = state.cache_hit_rate_pct();
        drop(state);

        self.prom.cache_hit_rate.set(rate);
    }

    pub fn increment_error_count(&self) {
        self.lock_state().error_count += 1;
        self.prom.errors_total.inc();
    }

    /// A consistent point-in-time copy of the aggregated metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (memory_usage_mb, cpu_usage_pct) = self.refresh_resource_gauges();

        let state = self.lock_state();
        MetricsSnapshot {
            avg_scan_time_seconds: state.scans.avg_seconds(),
            avg_fetch_time_seconds: state.fetches.avg_seconds(),
            symbols_per_second: state.scans.throughput(),
            total_scans: state.total_scans,
            total_fetches: state.total_fetches,
            error_count: state.error_count,
            cache_hit_rate_pct: state.cache_hit_rate_pct(),
            memory_usage_mb,
            cpu_usage_pct,
        }
    }

    /// Render the Prometheus registry in text exposition format.
    pub fn encode_prometheus(&self) -> Result<String> {
        // Resource gauges are sampled on read, not on record, so the
        // exposition must refresh them itself
        self.refresh_resource_gauges();

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Sample process memory and CPU and push them into their gauges.
    fn refresh_resource_gauges(&self) -> (f64, f64) {
        let memory_usage_mb = resident_memory_mb();
        let cpu_usage_pct = self.cpu.usage_pct();

        self.prom
            .memory_usage_bytes
            .set(memory_usage_mb * 1024.0 * 1024.0);
        self.prom.cpu_usage_percent.set(cpu_usage_pct);

        (memory_usage_mb, cpu_usage_pct)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// CPU time sample and the wall-clock instant it was taken at.
struct CpuSample {
    cpu_seconds: f64,
    taken_at: std::time::Instant,
}

/// Computes CPU usage percent as the process CPU time accrued between two
/// consecutive samples, divided by the wall-clock time between them.
#[derive(Default)]
struct CpuTracker {
    last: Mutex<Option<CpuSample>>,
}

impl CpuTracker {
    fn usage_pct(&self) -> f64 {
        let Some(cpu_seconds) = process_cpu_seconds() else {
            return 0.0;
        };
        let taken_at = std::time::Instant::now();

        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let pct = match last.as_ref() {
            Some(prev) => {
                let wall = taken_at.duration_since(prev.taken_at).as_secs_f64();
                if wall > 0.0 {
                    ((cpu_seconds - prev.cpu_seconds) / wall * 100.0).max(0.0)
                } else {
                    0.0
                }
            }
            // No baseline yet
            None => 0.0,
        };

        *last = Some(CpuSample {
            cpu_seconds,
            taken_at,
        });
        pct
    }
}

/// Total CPU time (utime + stime) consumed by the current process, in
/// seconds. The comm field in `/proc/self/stat` may contain spaces, so
/// parsing starts after the closing parenthesis.
#[cfg(target_os = "linux")]
fn process_cpu_seconds() -> Option<f64> {
    let ticks_per_second = 100.0;
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let mut fields = after_comm.split_whitespace();
    // utime and stime are the 12th and 13th fields after the comm
    let utime: f64 = fields.nth(11)?.parse().ok()?;
    let stime: f64 = fields.next()?.parse().ok()?;
    Some((utime + stime) / ticks_per_second)
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_seconds() -> Option<f64> {
    None
}

/// Resident set size of the current process in megabytes.
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> f64 {
    let page_size = 4096.0;
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<f64>().ok())
        })
        .map(|pages| pages * page_size / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> f64 {
    0.0
}
