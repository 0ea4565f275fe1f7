//! Alpaca Market Data v2 client.
//!
//! Fetches daily stock bars over the REST API, following pagination tokens
//! until the requested range is complete.

use super::{Bar, DataProvider, MarketDataSeries};
use crate::config::ProviderConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

const BARS_PAGE_LIMIT: u32 = 10_000;

/// Historical data provider backed by the Alpaca stocks/bars endpoint.
pub struct AlpacaDataProvider {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<AlpacaBar>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: u64,
}

impl AlpacaDataProvider {
    /// Create a new client from provider configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        page_token: Option<&str>,
    ) -> Result<BarsResponse> {
        let url = format!("{}/v2/stocks/{}/bars", self.base_url, symbol);
        let start_rfc = format!("{start}T00:00:00Z");
        let end_rfc = format!("{end}T23:59:59Z");
        let limit = BARS_PAGE_LIMIT.to_string();

        let mut query: Vec<(&str, &str)> = vec![
            ("timeframe", "1Day"),
            ("start", &start_rfc),
            ("end", &end_rfc),
            ("limit", &limit),
            ("adjustment", "raw"),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await
            .with_context(|| format!("Bars request for {symbol} failed"))?
            .error_for_status()
            .with_context(|| format!("Bars request for {symbol} rejected"))?;

        response
            .json::<BarsResponse>()
            .await
            .with_context(|| format!("Failed to decode bars response for {symbol}"))
    }
}

#[async_trait]
impl DataProvider for AlpacaDataProvider {
    async fn get_historical_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketDataSeries> {
        anyhow::ensure!(start <= end, "start date {start} is after end date {end}");

        let mut bars: Vec<Bar> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .fetch_page(symbol, start, end, page_token.as_deref())
                .await?;

            bars.extend(page.bars.into_iter().map(|b| Bar {
                timestamp: b.timestamp,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(symbol, bar_count = bars.len(), "Fetched historical bars");

        Ok(MarketDataSeries {
            symbol: symbol.to_string(),
            start,
            end,
            bars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> AlpacaDataProvider {
        AlpacaDataProvider::new(&ProviderConfig {
            kind: crate::config::ProviderKind::Alpaca,
            api_key: "test-key".to_string(),
            api_secret: "test-secret".to_string(),
            base_url: server.uri(),
            mock_latency_ms: 0,
        })
        .unwrap()
    }

    fn bar_json(day: &str, close: f64) -> serde_json::Value {
        json!({
            "t": format!("{day}T05:00:00Z"),
            "o": close - 1.0,
            "h": close + 1.0,
            "l": close - 2.0,
            "c": close,
            "v": 12345
        })
    }

    #[tokio::test]
    async fn test_fetches_and_maps_bars() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/AAPL/bars"))
            .and(header("APCA-API-KEY-ID", "test-key"))
            .and(header("APCA-API-SECRET-KEY", "test-secret"))
            .and(query_param("timeframe", "1Day"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bars": [bar_json("2024-01-02", 185.0), bar_json("2024-01-03", 184.25)],
                "symbol": "AAPL",
                "next_page_token": null
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let series = provider
            .get_historical_data(
                "AAPL",
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(series.symbol, "AAPL");
        assert_eq!(series.len(), 2);
        assert_eq!(series.bars[0].close, dec!(185.0));
        assert_eq!(series.bars[1].volume, 12345);
    }

    #[tokio::test]
    async fn test_follows_pagination_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/MSFT/bars"))
            .and(query_param("page_token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bars": [bar_json("2024-01-03", 370.0)],
                "symbol": "MSFT",
                "next_page_token": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/MSFT/bars"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bars": [bar_json("2024-01-02", 368.5)],
                "symbol": "MSFT",
                "next_page_token": "abc"
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let series = provider
            .get_historical_data(
                "MSFT",
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series.bars[0].close, dec!(368.5));
        assert_eq!(series.bars[1].close, dec!(370.0));
    }

    #[tokio::test]
    async fn test_http_error_surfaces_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/BAD/bars"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let result = provider
            .get_historical_data(
                "BAD",
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            )
            .await;

        assert!(result.is_err());
    }
}
