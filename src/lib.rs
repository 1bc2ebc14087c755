//! # Candle Backtester
//!
//! Bar-by-bar backtesting of long-only spot trading signals on OHLCV candles.
//!
//! ## Architecture
//!
//! - `market`: Candle type, intervals, CSV and Binance klines loaders
//! - `exchange`: Paper exchange with commission and lot-size rounding
//! - `strategy`: Signal providers, indicators and the strategy registry
//! - `risk`: Stop/target levels, entry sizing and the trend filter
//! - `backtest`: Simulation engine, performance metrics and parameter sweeps
//! - `persistence`: SQLite cache for candles and backtest run history
//! - `notify`: Telegram signal alerts
//! - `config`: Configuration management and validation
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backtest;
pub mod config;
pub mod exchange;
pub mod market;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
