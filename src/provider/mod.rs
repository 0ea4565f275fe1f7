//! Historical market-data providers.
//!
//! A single contract for fetching daily bars for a symbol over a date
//! range, with interchangeable implementations: a deterministic simulated
//! generator, a vendor API client, and a TTL-caching decorator that wraps
//! either.

mod alpaca;
mod cache;
mod mock;

pub use alpaca::AlpacaDataProvider;
pub use cache::CachedDataProvider;
pub use mock::SimulatedDataProvider;

use crate::config::{Config, ProviderKind};
use crate::metrics::MetricTracker;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// One OHLCV record for a single trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// An ordered series of daily bars for a symbol over a date range.
///
/// Immutable once fetched; cache entries and in-flight requests share it
/// without mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataSeries {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub bars: Vec<Bar>,
}

impl MarketDataSeries {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Closing prices in chronological order.
    pub fn closes(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.bars.iter().map(|b| b.close)
    }
}

/// Contract for fetching historical market data.
///
/// Implementations must be safe to call concurrently; the scanner fans out
/// one fetch per symbol across its worker pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Fetch daily bars for `symbol` over the inclusive `[start, end]` range.
    async fn get_historical_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketDataSeries>;
}

/// Build the configured provider, wrapped with the TTL cache when enabled.
pub fn build_provider(
    config: &Config,
    metrics: Arc<MetricTracker>,
) -> Result<Arc<dyn DataProvider>> {
    let base: Arc<dyn DataProvider> = match config.provider.kind {
        ProviderKind::Mock => {
            Arc::new(SimulatedDataProvider::new(config.provider.mock_latency_ms))
        }
        ProviderKind::Alpaca => Arc::new(AlpacaDataProvider::new(&config.provider)?),
    };

    if config.cache.enabled {
        info!(
            ttl_secs = config.cache.ttl_secs,
            cleanup_interval_secs = config.cache.cleanup_interval_secs,
            "Historical data cache enabled"
        );
        Ok(Arc::new(CachedDataProvider::new(
            base,
            config.cache_ttl(),
            config.cache_cleanup_interval(),
            metrics,
        )))
    } else {
        Ok(base)
    }
}
