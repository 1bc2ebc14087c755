//! Configuration management for the backtester.
//!
//! Loads settings from an optional `backtester.{toml,yaml,json}` file and
//! `CBT__`-prefixed environment variables (e.g. `CBT__RISK__STOP_LOSS_PCT`).

use crate::market::Interval;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Candle source and storage
    #[serde(default)]
    pub data: DataConfig,
    /// Simulation parameters
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Stops, sizing and entry filters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Strategy selection and indicator periods
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Signal notifications
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: Interval,
    /// Number of bars to fetch
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Read candles from this CSV instead of the exchange
    #[serde(default)]
    pub csv_path: Option<String>,
    #[serde(default = "default_binance_base_url")]
    pub binance_base_url: String,
    /// SQLite cache for candles and run history
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Fraction of notional charged per fill (0.001 = 0.1%)
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Allow several tagged entries to be open at once
    #[serde(default)]
    pub multi_position: bool,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Concurrent backtests during a parameter sweep
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

/// How an entry's capital share is computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PositionSizing {
    /// Always `position_size_pct` of equity.
    Fixed,
    /// `min(max_fraction, confidence × scale)` of equity.
    ConfidenceScaled { scale: Decimal, max_fraction: Decimal },
}

/// Volatility stops: `entry ∓ multiplier × ATR` at entry time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrStopConfig {
    #[serde(default = "default_atr_period")]
    pub period: usize,
    #[serde(default = "default_atr_stop_multiplier")]
    pub stop_multiplier: f64,
    #[serde(default = "default_atr_target_multiplier")]
    pub target_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Exit when the mark falls this far below entry (0.03 = 3%)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Exit when the mark rises this far above entry
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Entries need strictly higher confidence than this
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Share of equity committed per entry (0.0-1.0)
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
    /// Only enter while the fast trend EMA is above the slow one
    #[serde(default)]
    pub use_trend_filter: bool,
    #[serde(default = "default_sizing")]
    pub sizing: PositionSizing,
    /// Replaces the percentage stops when set
    #[serde(default)]
    pub atr_stops: Option<AtrStopConfig>,
    #[serde(default = "default_trend_fast")]
    pub trend_fast: usize,
    #[serde(default = "default_trend_slow")]
    pub trend_slow: usize,
    /// Entry quantities are rounded down to this step
    #[serde(default = "default_quantity_step")]
    pub quantity_step: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Registry name of the strategy to run
    #[serde(default = "default_strategy_name")]
    pub name: String,
    #[serde(default = "default_sma_fast")]
    pub sma_fast: usize,
    #[serde(default = "default_sma_slow")]
    pub sma_slow: usize,
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// Rolling VWAP length in bars
    #[serde(default = "default_session_window")]
    pub vwap_window: usize,
    /// Bars aggregated into one pivot session
    #[serde(default = "default_session_window")]
    pub pivot_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_base_url")]
    pub base_url: String,
}

// Default value functions
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> Interval {
    Interval::Hour1
}

fn default_lookback() -> usize {
    1000
}

fn default_binance_base_url() -> String {
    crate::market::SPOT_BASE_URL.to_string()
}

fn default_db_path() -> String {
    "data/candles.db".to_string()
}

fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_commission_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_max_open_positions() -> usize {
    3
}

fn default_sweep_concurrency() -> usize {
    4
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_take_profit_pct() -> Decimal {
    Decimal::new(6, 2) // 0.06
}

fn default_min_confidence() -> f64 {
    0.70
}

fn default_position_size_pct() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_sizing() -> PositionSizing {
    PositionSizing::Fixed
}

fn default_trend_fast() -> usize {
    50
}

fn default_trend_slow() -> usize {
    200
}

fn default_quantity_step() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_stop_multiplier() -> f64 {
    2.0
}

fn default_atr_target_multiplier() -> f64 {
    3.0
}

fn default_strategy_name() -> String {
    "ema_rsi_atr".to_string()
}

fn default_sma_fast() -> usize {
    20
}

fn default_sma_slow() -> usize {
    50
}

fn default_ema_fast() -> usize {
    12
}

fn default_ema_slow() -> usize {
    26
}

fn default_rsi_period() -> usize {
    14
}

fn default_session_window() -> usize {
    24
}

fn default_telegram_base_url() -> String {
    "https://api.telegram.org".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("backtester").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CBT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.data.symbol.is_empty(), "symbol must not be empty");
        anyhow::ensure!(self.data.lookback > 0, "lookback must be positive");

        anyhow::ensure!(
            self.backtest.initial_capital >= Decimal::ZERO,
            "initial_capital must be non-negative"
        );
        anyhow::ensure!(
            self.backtest.commission_rate >= Decimal::ZERO
                && self.backtest.commission_rate < Decimal::ONE,
            "commission_rate must be in [0, 1)"
        );
        anyhow::ensure!(
            self.backtest.max_open_positions >= 1,
            "max_open_positions must be at least 1"
        );
        anyhow::ensure!(
            self.backtest.sweep_concurrency >= 1,
            "sweep_concurrency must be at least 1"
        );

        self.risk.validate()
    }
}

impl RiskConfig {
    /// Fractions in range, periods ordered, positive quantity step.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.stop_loss_pct > Decimal::ZERO && self.stop_loss_pct < Decimal::ONE,
            "stop_loss_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            self.take_profit_pct > Decimal::ZERO,
            "take_profit_pct must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_confidence),
            "min_confidence must be between 0 and 1"
        );
        anyhow::ensure!(
            self.position_size_pct > Decimal::ZERO && self.position_size_pct <= Decimal::ONE,
            "position_size_pct must be between 0 and 1"
        );
        if let PositionSizing::ConfidenceScaled {
            scale,
            max_fraction,
        } = self.sizing
        {
            anyhow::ensure!(scale > Decimal::ZERO, "sizing scale must be positive");
            anyhow::ensure!(
                max_fraction > Decimal::ZERO && max_fraction <= Decimal::ONE,
                "sizing max_fraction must be between 0 and 1"
            );
        }
        if let Some(atr) = &self.atr_stops {
            anyhow::ensure!(atr.period > 0, "ATR period must be positive");
            anyhow::ensure!(
                atr.stop_multiplier > 0.0 && atr.target_multiplier > 0.0,
                "ATR multipliers must be positive"
            );
        }
        anyhow::ensure!(
            self.trend_fast > 0 && self.trend_fast < self.trend_slow,
            "trend_fast must be positive and below trend_slow"
        );
        anyhow::ensure!(
            self.quantity_step > Decimal::ZERO,
            "quantity_step must be positive"
        );
        Ok(())
    }
}

impl TelegramConfig {
    pub fn is_enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            interval: default_interval(),
            lookback: default_lookback(),
            csv_path: None,
            binance_base_url: default_binance_base_url(),
            db_path: default_db_path(),
        }
    }
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            commission_rate: default_commission_rate(),
            multi_position: false,
            max_open_positions: default_max_open_positions(),
            sweep_concurrency: default_sweep_concurrency(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            min_confidence: default_min_confidence(),
            position_size_pct: default_position_size_pct(),
            use_trend_filter: false,
            sizing: default_sizing(),
            atr_stops: None,
            trend_fast: default_trend_fast(),
            trend_slow: default_trend_slow(),
            quantity_step: default_quantity_step(),
        }
    }
}

impl Default for AtrStopConfig {
    fn default() -> Self {
        Self {
            period: default_atr_period(),
            stop_multiplier: default_atr_stop_multiplier(),
            target_multiplier: default_atr_target_multiplier(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            sma_fast: default_sma_fast(),
            sma_slow: default_sma_slow(),
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            rsi_period: default_rsi_period(),
            atr_period: default_atr_period(),
            vwap_window: default_session_window(),
            pivot_window: default_session_window(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            base_url: default_telegram_base_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.data.symbol, "BTCUSDT");
        assert_eq!(config.data.interval, Interval::Hour1);
        assert_eq!(config.backtest.initial_capital, dec!(10000));
        assert!(!config.telegram.is_enabled());
    }

    #[test]
    fn test_risk_validation_rejects_bad_fractions() {
        let mut risk = RiskConfig::default();
        risk.position_size_pct = dec!(1.5);
        assert!(risk.validate().is_err());

        let mut risk = RiskConfig::default();
        risk.stop_loss_pct = Decimal::ZERO;
        assert!(risk.validate().is_err());

        let mut risk = RiskConfig::default();
        risk.trend_fast = 300;
        assert!(risk.validate().is_err());
    }

    #[test]
    fn test_commission_bounds() {
        let mut config = Config::default();
        config.backtest.commission_rate = Decimal::ONE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let raw = r#"{
            "data": { "symbol": "ETHUSDT", "interval": "4h" },
            "risk": {
                "stop_loss_pct": "0.05",
                "sizing": { "mode": "confidence_scaled", "scale": "0.5", "max_fraction": "0.6" }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.data.symbol, "ETHUSDT");
        assert_eq!(config.data.interval, Interval::Hour4);
        assert_eq!(config.data.lookback, 1000);
        assert_eq!(config.risk.stop_loss_pct, dec!(0.05));
        assert_eq!(config.risk.take_profit_pct, dec!(0.06));
        assert_eq!(
            config.risk.sizing,
            PositionSizing::ConfidenceScaled {
                scale: dec!(0.5),
                max_fraction: dec!(0.6)
            }
        );
        assert!(config.validate().is_ok());
    }
}
