//! TTL-caching decorator for data providers.
//!
//! Deduplicates identical historical-data requests within a time-to-live
//! window. Expired entries are dropped lazily on lookup and by a periodic
//! sweep task. Concurrent misses for the same key may each fetch and
//! overwrite; last writer wins.

use super::{DataProvider, MarketDataSeries};
use crate::metrics::MetricTracker;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    symbol: String,
    start: NaiveDate,
    end: NaiveDate,
}

struct CacheEntry {
    series: MarketDataSeries,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Wraps a [`DataProvider`] with a concurrent TTL cache keyed by
/// (symbol, start, end).
pub struct CachedDataProvider {
    inner: Arc<dyn DataProvider>,
    cache: Arc<DashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    metrics: Arc<MetricTracker>,
}

impl CachedDataProvider {
    /// Create the decorator and start its background sweep task. The sweep
    /// task holds only a weak reference and exits once the cache is dropped,
    /// so rebuilding the provider on config reload does not leak tasks.
    pub fn new(
        inner: Arc<dyn DataProvider>,
        ttl: Duration,
        cleanup_interval: Duration,
        metrics: Arc<MetricTracker>,
    ) -> Self {
        let cache = Arc::new(DashMap::new());
        spawn_sweeper(Arc::downgrade(&cache), cleanup_interval);

        Self {
            inner,
            cache,
            ttl,
            metrics,
        }
    }

    /// Number of live (possibly expired but not yet swept) entries.
    pub fn entry_count(&self) -> usize {
        self.cache.len()
    }
}

fn spawn_sweeper(cache: Weak<DashMap<CacheKey, CacheEntry>>, cleanup_interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        // The first tick fires immediately; skip it
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let before = cache.len();
            cache.retain(|_, entry| !entry.is_expired());
            let purged = before - cache.len();
            if purged > 0 {
                debug!(purged, remaining = cache.len(), "Purged expired cache entries");
            }
        }
    });
}

#[async_trait]
impl DataProvider for CachedDataProvider {
    async fn get_historical_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketDataSeries> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            start,
            end,
        };

        // Lazy expiry check on access; the entry is removed so a concurrent
        // reader cannot serve it either.
        if let Some(entry) = self.cache.get(&key) {
            if !entry.is_expired() {
                self.metrics.record_cache_hit();
                trace!(symbol, "Cache hit");
                return Ok(entry.series.clone());
            }
            drop(entry);
            self.cache.remove(&key);
        }

        self.metrics.record_cache_miss();
        trace!(symbol, "Cache miss");

        let series = self.inner.get_historical_data(symbol, start, end).await?;

        self.cache.insert(
            key,
            CacheEntry {
                series: series.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(series)
    }
}
