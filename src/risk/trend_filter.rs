//! EMA trend gate for new entries.

use crate::market::Candle;
use crate::strategy::indicators::{closes, ema_series};

/// Fast/slow EMA series over the whole run, computed once.
///
/// Both series are causal (value `i` only uses closes `0..=i`), so querying
/// bar `i` never sees later prices.
#[derive(Debug, Clone)]
pub struct TrendFilter {
    fast: Vec<f64>,
    slow: Vec<f64>,
}

impl TrendFilter {
    pub fn new(candles: &[Candle], fast_period: usize, slow_period: usize) -> Self {
        let prices = closes(candles);
        Self {
            fast: ema_series(&prices, fast_period),
            slow: ema_series(&prices, slow_period),
        }
    }

    /// Uptrend at bar `index`: fast EMA strictly above slow EMA.
    pub fn allows(&self, index: usize) -> bool {
        match (self.fast.get(index), self.slow.get(index)) {
            (Some(fast), Some(slow)) => fast > slow,
            _ => false,
        }
    }
}
