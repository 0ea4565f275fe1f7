//! Deterministic simulated data provider.
//!
//! Generates a daily random-walk series seeded from the symbol name, so the
//! same request always yields the same bars. Weekends are skipped the way a
//! real equities feed would. An optional artificial latency approximates a
//! slow upstream for load and timeout testing.

use super::{Bar, DataProvider, MarketDataSeries};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::Decimal;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

pub struct SimulatedDataProvider {
    latency: Duration,
}

impl SimulatedDataProvider {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
        }
    }
}

#[async_trait]
impl DataProvider for SimulatedDataProvider {
    async fn get_historical_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketDataSeries> {
        anyhow::ensure!(start <= end, "start date {start} is after end date {end}");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut rng = SymbolRng::new(symbol);

        // Base price between $50.00 and $200.00, tracked in cents
        let mut price_cents: i64 = 5_000 + (rng.next() % 15_000) as i64;

        let mut bars = Vec::new();
        let mut day = start;
        while day <= end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                // Daily change between -2% and +2%, in basis points
                let change_bp = (rng.next() % 400) as i64 - 200;
                price_cents = price_cents * (10_000 + change_bp) / 10_000;

                let close = Decimal::new(price_cents, 2);
                bars.push(Bar {
                    timestamp: day.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc(),
                    open: close * Decimal::new(99, 2),
                    high: close * Decimal::new(102, 2),
                    low: close * Decimal::new(98, 2),
                    close,
                    volume: 1_000_000 + rng.next() % 1_000_000,
                });
            }
            day = day.succ_opt().expect("date overflow");
        }

        Ok(MarketDataSeries {
            symbol: symbol.to_string(),
            start,
            end,
            bars,
        })
    }
}

/// Small xorshift generator seeded from the symbol name.
struct SymbolRng {
    state: u64,
}

impl SymbolRng {
    fn new(symbol: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        // Avoid the degenerate all-zero state
        Self {
            state: hasher.finish() | 1,
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}
