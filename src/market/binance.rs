//! Binance public klines client.

use super::{validate_series, Candle, CandleSource, Interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, instrument};

pub const SPOT_BASE_URL: &str = "https://api.binance.com";

/// Maximum rows Binance returns per klines request.
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Read-only client for historical OHLCV data. No credentials needed.
pub struct BinanceKlineClient {
    http: Client,
    base_url: String,
}

impl BinanceKlineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch a single page of klines ending at `end_time_ms` (inclusive) if given.
    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        end_time_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(end) = end_time_ms {
            query.push(("endTime", end.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("Failed to fetch klines")?
            .error_for_status()
            .context("Klines request rejected")?;

        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .context("Failed to parse klines response")?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }
}

#[async_trait]
impl CandleSource for BinanceKlineClient {
    /// Walk backwards from now in pages until `lookback` bars are collected
    /// or the exchange runs out of history.
    async fn fetch(&self, symbol: &str, interval: Interval, lookback: usize) -> Result<Vec<Candle>> {
        let mut candles: Vec<Candle> = Vec::with_capacity(lookback);
        let mut end_time_ms: Option<i64> = None;

        while candles.len() < lookback {
            let limit = (lookback - candles.len()).min(MAX_KLINES_PER_REQUEST);
            let mut page = self.fetch_page(symbol, interval, limit, end_time_ms).await?;
            let page_len = page.len();

            debug!(symbol, interval = %interval, page_len, "Fetched klines page");

            if page.is_empty() {
                break;
            }
            end_time_ms = Some(page[0].timestamp.timestamp_millis() - 1);
            page.append(&mut candles);
            candles = page;

            if page_len < limit {
                break;
            }
        }

        validate_series(&candles).context("Klines failed validation")?;
        Ok(candles)
    }
}

fn parse_kline(row: &[Value]) -> Result<Candle> {
    anyhow::ensure!(row.len() >= 6, "kline row has {} fields, expected at least 6", row.len());

    let open_time = row[0].as_i64().context("kline open time is not an integer")?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .with_context(|| format!("Invalid kline open time: {}", open_time))?;

    Ok(Candle {
        timestamp,
        open: decimal_field(&row[1], "open")?,
        high: decimal_field(&row[2], "high")?,
        low: decimal_field(&row[3], "low")?,
        close: decimal_field(&row[4], "close")?,
        volume: decimal_field(&row[5], "volume")?,
    })
}

fn decimal_field(value: &Value, name: &str) -> Result<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).with_context(|| format!("Invalid {}: {}", name, s)),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .with_context(|| format!("Invalid {}: {}", name, n)),
        other => anyhow::bail!("Unexpected {} value: {}", name, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kline(open_time: i64, close: &str) -> Value {
        json!([open_time, "100.0", "110.0", "90.0", close, "12.5", open_time + 3_599_999, "0", 10, "0", "0", "0"])
    }

    #[test]
    fn test_parse_kline_row() {
        let row = kline(1_704_067_200_000, "105.5");
        let candle = parse_kline(row.as_array().unwrap()).unwrap();
        assert_eq!(candle.close, dec!(105.5));
        assert_eq!(candle.volume, dec!(12.5));
        assert_eq!(candle.timestamp.timestamp_millis(), 1_704_067_200_000);
    }

    #[test]
    fn test_parse_kline_rejects_short_row() {
        assert!(parse_kline(&[json!(1), json!("1")]).is_err());
    }

    #[tokio::test]
    async fn test_fetch_single_page() {
        let server = MockServer::start().await;
        let body = json!([kline(1_704_067_200_000, "101"), kline(1_704_070_800_000, "102")]);

        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("interval", "1h"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = BinanceKlineClient::new(&server.uri()).unwrap();
        let candles = client.fetch("BTCUSDT", Interval::Hour1, 5).await.unwrap();

        // fewer rows than requested ends pagination
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(102));
    }

    #[tokio::test]
    async fn test_fetch_empty_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = BinanceKlineClient::new(&server.uri()).unwrap();
        let candles = client.fetch("NEWUSDT", Interval::Day1, 100).await.unwrap();
        assert!(candles.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = BinanceKlineClient::new(&server.uri()).unwrap();
        assert!(client.fetch("BAD", Interval::Hour1, 10).await.is_err());
    }
}
