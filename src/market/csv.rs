//! CSV candle import.

use super::{validate_series, Candle, CandleSource, Interval};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tracing::warn;

/// CSV candle loader for offline backtesting.
///
/// Expected CSV format (timestamps as RFC 3339 or epoch milliseconds):
/// ```csv
/// timestamp,open,high,low,close,volume
/// 2024-01-01T00:00:00Z,42000.5,42310,41950,42280.25,1532.7
/// ```
#[derive(Debug, Clone)]
pub struct CsvCandleLoader {
    candles: Vec<Candle>,
}

impl CsvCandleLoader {
    /// Load candles from a CSV file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        Self::from_csv_content(&content)
    }

    /// Parse candles from CSV content.
    pub fn from_csv_content(content: &str) -> Result<Self> {
        let mut candles = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.starts_with("timestamp") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let candle = parse_row(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            candles.push(candle);
        }

        if candles.is_empty() {
            warn!("CSV file contains no data rows");
        }

        // Files exported by hand are often unsorted; ordering is fixed here,
        // duplicates still fail validation.
        candles.sort_by_key(|c| c.timestamp);
        validate_series(&candles).context("CSV candles failed validation")?;

        Ok(Self { candles })
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// First and last timestamp in the file.
    pub fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.candles.first()?.timestamp, self.candles.last()?.timestamp))
    }

    /// Write candles in the format [`CsvCandleLoader::new`] reads.
    pub fn write<P: AsRef<Path>>(path: P, candles: &[Candle]) -> Result<()> {
        use std::io::Write;
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        writeln!(file, "timestamp,open,high,low,close,volume")?;

        for c in candles {
            writeln!(
                file,
                "{},{},{},{},{},{}",
                c.timestamp.to_rfc3339(),
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume
            )?;
        }

        Ok(())
    }

    /// Candles within `[start, end]`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Candle> {
        self.candles
            .iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CandleSource for CsvCandleLoader {
    async fn fetch(&self, _symbol: &str, _interval: Interval, lookback: usize) -> Result<Vec<Candle>> {
        let skip = self.candles.len().saturating_sub(lookback);
        Ok(self.candles[skip..].to_vec())
    }
}

fn parse_row(line: &str) -> Result<Candle> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        anyhow::bail!(
            "Expected 6 columns (timestamp,open,high,low,close,volume), got {}",
            parts.len()
        );
    }

    Ok(Candle {
        timestamp: parse_timestamp(parts[0])?,
        open: parts[1]
            .parse()
            .with_context(|| format!("Invalid open: {}", parts[1]))?,
        high: parts[2]
            .parse()
            .with_context(|| format!("Invalid high: {}", parts[2]))?,
        low: parts[3]
            .parse()
            .with_context(|| format!("Invalid low: {}", parts[3]))?,
        close: parts[4]
            .parse()
            .with_context(|| format!("Invalid close: {}", parts[4]))?,
        volume: parts[5]
            .parse()
            .with_context(|| format!("Invalid volume: {}", parts[5]))?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .with_context(|| format!("Invalid epoch millis: {}", raw));
    }
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("Invalid timestamp: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"timestamp,open,high,low,close,volume
2024-01-01T01:00:00Z,101,103,100,102,12
2024-01-01T00:00:00Z,100,102,99,101,10
1704074400000,102,104,101,103,9
"#;

    #[test]
    fn test_csv_parsing_sorts_rows() {
        let loader = CsvCandleLoader::from_csv_content(SAMPLE).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!(loader.candles()[0].close, dec!(101));
        assert_eq!(loader.candles()[2].close, dec!(103));

        let (start, end) = loader.available_range().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_csv_rejects_bad_bars() {
        let csv = "timestamp,open,high,low,close,volume\n2024-01-01T00:00:00Z,100,99,98,101,1\n";
        assert!(CsvCandleLoader::from_csv_content(csv).is_err());

        let short = "timestamp,open,high,low,close,volume\n2024-01-01T00:00:00Z,100,101\n";
        assert!(CsvCandleLoader::from_csv_content(short).is_err());
    }

    #[test]
    fn test_header_only_csv_is_an_empty_series() {
        let loader =
            CsvCandleLoader::from_csv_content("timestamp,open,high,low,close,volume\n").unwrap();
        assert!(loader.is_empty());
        assert!(loader.available_range().is_none());

        let tail = tokio_test::block_on(loader.fetch("BTCUSDT", Interval::Hour1, 50)).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn test_between_filters_inclusive() {
        let loader = CsvCandleLoader::from_csv_content(SAMPLE).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(loader.between(start, end).len(), 2);
    }

    #[test]
    fn test_write_then_reload() {
        let loader = CsvCandleLoader::from_csv_content(SAMPLE).unwrap();
        let path = std::env::temp_dir().join(format!("candles-{}.csv", std::process::id()));

        CsvCandleLoader::write(&path, loader.candles()).unwrap();
        let reloaded = CsvCandleLoader::new(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(reloaded.candles(), loader.candles());
    }

    #[test]
    fn test_fetch_returns_tail() {
        let loader = CsvCandleLoader::from_csv_content(SAMPLE).unwrap();
        let tail = tokio_test::block_on(loader.fetch("BTCUSDT", Interval::Hour1, 2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].close, dec!(103));

        let all = tokio_test::block_on(loader.fetch("BTCUSDT", Interval::Hour1, 50)).unwrap();
        assert_eq!(all.len(), 3);
    }
}
