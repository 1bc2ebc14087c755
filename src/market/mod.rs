//! Market data: candles, intervals and the sources that produce them.
//!
//! Every source validates what it returns with [`validate_series`], so the
//! backtest engine can assume ordered, well-formed bars.

mod binance;
mod csv;

pub use binance::{BinanceKlineClient, SPOT_BASE_URL};
pub use csv::CsvCandleLoader;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check the OHLC ordering and sign constraints of a single bar.
    pub fn validate(&self) -> Result<(), DataError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| *p <= Decimal::ZERO) {
            return Err(DataError::NonPositivePrice(self.timestamp));
        }
        if self.volume < Decimal::ZERO {
            return Err(DataError::NegativeVolume(self.timestamp));
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(DataError::InvalidRange(self.timestamp));
        }
        Ok(())
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Ingestion-time data quality errors.
#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    #[error("non-positive price in bar at {0}")]
    NonPositivePrice(DateTime<Utc>),
    #[error("negative volume in bar at {0}")]
    NegativeVolume(DateTime<Utc>),
    #[error("high/low do not bracket open/close in bar at {0}")]
    InvalidRange(DateTime<Utc>),
    #[error("timestamps not strictly ascending: {previous} then {current}")]
    NotAscending {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("unknown interval: {0}")]
    UnknownInterval(String),
}

/// Validate a candle series: every bar well-formed, timestamps strictly ascending.
pub fn validate_series(candles: &[Candle]) -> Result<(), DataError> {
    for candle in candles {
        candle.validate()?;
    }
    for pair in candles.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(DataError::NotAscending {
                previous: pair[0].timestamp,
                current: pair[1].timestamp,
            });
        }
    }
    Ok(())
}

/// Bar interval of a series. Drives annualization in the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1w",
        }
    }

    /// Number of bars in one calendar day.
    pub fn bars_per_day(&self) -> f64 {
        match self {
            Interval::Minute1 => 1440.0,
            Interval::Minute5 => 288.0,
            Interval::Minute15 => 96.0,
            Interval::Minute30 => 48.0,
            Interval::Hour1 => 24.0,
            Interval::Hour4 => 6.0,
            Interval::Day1 => 1.0,
            Interval::Week1 => 1.0 / 7.0,
        }
    }

    pub fn bars_per_year(&self) -> f64 {
        self.bars_per_day() * 365.0
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            Interval::Minute1 => chrono::Duration::minutes(1),
            Interval::Minute5 => chrono::Duration::minutes(5),
            Interval::Minute15 => chrono::Duration::minutes(15),
            Interval::Minute30 => chrono::Duration::minutes(30),
            Interval::Hour1 => chrono::Duration::hours(1),
            Interval::Hour4 => chrono::Duration::hours(4),
            Interval::Day1 => chrono::Duration::days(1),
            Interval::Week1 => chrono::Duration::weeks(1),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Interval::Minute1),
            "5m" => Ok(Interval::Minute5),
            "15m" => Ok(Interval::Minute15),
            "30m" => Ok(Interval::Minute30),
            "1h" => Ok(Interval::Hour1),
            "4h" => Ok(Interval::Hour4),
            "1d" => Ok(Interval::Day1),
            "1w" => Ok(Interval::Week1),
            other => Err(DataError::UnknownInterval(other.to_string())),
        }
    }
}

/// Anything that can supply a historical candle series.
///
/// Results are ascending by timestamp and may be shorter than `lookback`
/// when history is unavailable; an empty vector means "insufficient data".
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch(&self, symbol: &str, interval: Interval, lookback: usize)
        -> Result<Vec<Candle>>;
}
