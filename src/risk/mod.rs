//! Position and risk management for the backtest loop.
//!
//! - Stop-loss / take-profit exit checks (percentage or ATR based)
//! - Entry sizing from equity, confidence and affordability
//! - Optional EMA trend gate on new entries

mod manager;
mod trend_filter;

pub use manager::{ExitLevels, ExitReason, RiskManager};
pub use trend_filter::TrendFilter;
