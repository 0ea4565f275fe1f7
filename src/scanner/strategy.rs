//! Trading-signal strategies.
//!
//! Each strategy is a named rule evaluated against a symbol's bar series to
//! produce a directional signal, or nothing when the setup is absent.
//! Unknown strategy identifiers are skipped by the scanner rather than
//! treated as errors.

use crate::provider::MarketDataSeries;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;

/// Directional bias produced by a strategy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Signal {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Long => write!(f, "LONG"),
            Signal::Short => write!(f, "SHORT"),
        }
    }
}

/// Strategies known to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Price consolidating near the top of its range
    HighBase,
    /// Price consolidating near the bottom of its range
    LowBase,
    /// Uptrend with a pullback off the high
    BullPullback,
    /// Downtrend with a relief rally off the low
    BearRally,
}

/// Fraction of the close range that counts as "near" an extreme.
const BASE_ZONE: Decimal = dec!(0.4);

impl Strategy {
    /// Parse a strategy identifier; `None` for unknown identifiers.
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "HIGH_BASE" => Some(Strategy::HighBase),
            "LOW_BASE" => Some(Strategy::LowBase),
            "BULL_PULLBACK" => Some(Strategy::BullPullback),
            "BEAR_RALLY" => Some(Strategy::BearRally),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Strategy::HighBase => "HIGH_BASE",
            Strategy::LowBase => "LOW_BASE",
            Strategy::BullPullback => "BULL_PULLBACK",
            Strategy::BearRally => "BEAR_RALLY",
        }
    }

    /// Evaluate this strategy against a bar series.
    ///
    /// Needs at least two bars; with fewer there is no trend or range to
    /// judge and the result is `None`.
    pub fn evaluate(&self, series: &MarketDataSeries) -> Option<Signal> {
        if series.len() < 2 {
            return None;
        }

        let first = series.bars.first()?.close;
        let last = series.bars.last()?.close;
        let high = series.closes().max()?;
        let low = series.closes().min()?;
        let range = high - low;

        // A perfectly flat series has no usable setup
        if range.is_zero() {
            return None;
        }

        let position = (last - low) / range;

        match self {
            Strategy::HighBase => (position >= Decimal::ONE - BASE_ZONE).then_some(Signal::Long),
            Strategy::LowBase => (position <= BASE_ZONE).then_some(Signal::Short),
            Strategy::BullPullback => (last > first && last < high).then_some(Signal::Long),
            Strategy::BearRally => (last < first && last > low).then_some(Signal::Short),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Bar;
    use chrono::NaiveDate;

    fn series_from_closes(closes: &[i64]) -> MarketDataSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let close = Decimal::new(*close, 0);
                Bar {
                    timestamp: (start + chrono::Duration::days(i as i64))
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
            symbol: "TEST".to_string(),
            start,
            end: start + chrono::Duration::days(closes.len() as i64),
            bars,
        }
    }

    #[test]
    fn test_parse_known_identifiers() {
        assert_eq!(Strategy::parse("HIGH_BASE"), Some(Strategy::HighBase));
        assert_eq!(Strategy::parse("LOW_BASE"), Some(Strategy::LowBase));
        assert_eq!(Strategy::parse("BULL_PULLBACK"), Some(Strategy::BullPullback));
        assert_eq!(Strategy::parse("BEAR_RALLY"), Some(Strategy::BearRally));
    }

    #[test]
    fn test_parse_unknown_identifier() {
        assert_eq!(Strategy::parse("IRON_CONDOR"), None);
        assert_eq!(Strategy::parse("high_base"), None);
        assert_eq!(Strategy::parse(""), None);
    }

    #[test]
    fn test_id_round_trips() {
        for strategy in [
            Strategy::HighBase,
            Strategy::LowBase,
            Strategy::BullPullback,
            Strategy::BearRally,
        ] {
            assert_eq!(Strategy::parse(strategy.id()), Some(strategy));
        }
    }

    #[test]
    fn test_high_base_fires_near_range_high() {
        // Rallies then consolidates at the top
        let series = series_from_closes(&[100, 105, 110, 112, 111, 112]);
        assert_eq!(Strategy::HighBase.evaluate(&series), Some(Signal::Long));
        assert_eq!(Strategy::LowBase.evaluate(&series), None);
    }

    #[test]
    fn test_low_base_fires_near_range_low() {
        let series = series_from_closes(&[112, 108, 102, 100, 101, 100]);
        assert_eq!(Strategy::LowBase.evaluate(&series), Some(Signal::Short));
        assert_eq!(Strategy::HighBase.evaluate(&series), None);
    }

    #[test]
    fn test_bull_pullback() {
        // Uptrend, closes below its own high
        let series = series_from_closes(&[100, 110, 120, 115]);
        assert_eq!(
            Strategy::BullPullback.evaluate(&series),
            Some(Signal::Long)
        );
        // Closing at the high is not a pullback
        let at_high = series_from_closes(&[100, 110, 120]);
        assert_eq!(Strategy::BullPullback.evaluate(&at_high), None);
    }

    #[test]
    fn test_bear_rally() {
        let series = series_from_closes(&[120, 110, 100, 105]);
        assert_eq!(Strategy::BearRally.evaluate(&series), Some(Signal::Short));
        let at_low = series_from_closes(&[120, 110, 100]);
        assert_eq!(Strategy::BearRally.evaluate(&at_low), None);
    }

    #[test]
    fn test_too_few_bars_yields_no_signal() {
        let series = series_from_closes(&[100]);
        for strategy in [
            Strategy::HighBase,
            Strategy::LowBase,
            Strategy::BullPullback,
            Strategy::BearRally,
        ] {
            assert_eq!(strategy.evaluate(&series), None);
        }
    }

    #[test]
    fn test_flat_series_yields_no_signal() {
        let series = series_from_closes(&[100, 100, 100, 100]);
        assert_eq!(Strategy::HighBase.evaluate(&series), None);
        assert_eq!(Strategy::LowBase.evaluate(&series), None);
    }

    #[test]
    fn test_signal_display_matches_wire_labels() {
        assert_eq!(Signal::Long.to_string(), "LONG");
        assert_eq!(Signal::Short.to_string(), "SHORT");
    }
}
