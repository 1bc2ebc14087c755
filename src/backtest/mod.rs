//! Backtesting module for evaluating signal providers on historical candles.
//!
//! This module provides:
//! - Bar-by-bar simulation engine with stop/target exits
//! - Trade ledger and equity curve records
//! - Performance metrics calculation
//! - Parameter sweep for optimization
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_backtester::backtest::{BacktestEngine, EngineConfig};
//! use candle_backtester::config::RiskConfig;
//! use candle_backtester::strategy::EmaCross;
//!
//! let engine = BacktestEngine::new(
//!     EngineConfig::default(),
//!     RiskConfig::default(),
//!     Arc::new(EmaCross::new(12, 26)),
//! )?;
//! let result = engine.run(&candles);
//! println!("Return: {:.2}%", result.metrics.total_return * 100.0);
//! ```

mod engine;
mod ledger;
mod metrics;
mod runner;

pub use engine::{
    run_backtest, BacktestEngine, BacktestError, BacktestResult, BarFault, BarOutcome, DEFAULT_TAG,
};
pub use ledger::{EquityPoint, RealizedPnl, TradeEvent, TradeKind};
pub use metrics::PerformanceMetrics;
pub use runner::{ParameterSpace, SweepResults, SweepRunner};

use crate::config::BacktestSettings;
use crate::market::Interval;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How many entries may be open at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    /// At most one open position; buys while long are ignored.
    Single,
    /// Up to `max_open` entries, at most one per entry tag.
    Multi { max_open: usize },
}

/// Run parameters that stay fixed for the whole simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Starting cash
    pub initial_capital: Decimal,

    /// Fraction of notional charged per fill
    pub commission_rate: Decimal,

    /// Bar interval, used for annualization and the initial equity sample
    pub interval: Interval,

    pub position_mode: PositionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::new(10000, 0), // $10,000
            commission_rate: Decimal::new(1, 3),     // 0.1%
            interval: Interval::Hour1,
            position_mode: PositionMode::Single,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &BacktestSettings, interval: Interval) -> Self {
        let position_mode = if settings.multi_position {
            PositionMode::Multi {
                max_open: settings.max_open_positions,
            }
        } else {
            PositionMode::Single
        };

        Self {
            initial_capital: settings.initial_capital,
            commission_rate: settings.commission_rate,
            interval,
            position_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rust_decimal_macros::dec;

    #[test]
    fn test_engine_config_from_settings() {
        let mut settings = Config::default().backtest;
        let config = EngineConfig::from_settings(&settings, Interval::Day1);
        assert_eq!(config.initial_capital, dec!(10000));
        assert_eq!(config.commission_rate, dec!(0.001));
        assert_eq!(config.interval, Interval::Day1);
        assert_eq!(config.position_mode, PositionMode::Single);

        settings.multi_position = true;
        settings.max_open_positions = 2;
        let config = EngineConfig::from_settings(&settings, Interval::Hour4);
        assert_eq!(config.position_mode, PositionMode::Multi { max_open: 2 });
    }
}
