//! Simulated execution venue.
//!
//! The paper exchange is the only owner of cash and position state during a
//! backtest run. There is no live order routing.

mod paper;

pub use paper::{ExchangeError, Fill, OrderSide, PaperExchange};
