//! Technical indicators over `f64` series.
//!
//! Every function looks only at the slice it is given, so callers keep the
//! no-lookahead guarantee by passing a history prefix. Functions return
//! `None` when the window is not yet filled or the value is undefined.

use crate::market::Candle;

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::close_f64).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::volume_f64).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n − 1 denominator).
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    mean(&values[values.len() - period..])
}

/// Recursive EMA with `alpha = 2 / (period + 1)`, seeded with the first value.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// RSI from rolling means of gains and losses over the last `period` changes.
///
/// Undefined when the window is flat (no gains and no losses).
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let window = &values[values.len() - period - 1..];
    let (gain, loss) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            (g + delta, l)
        } else {
            (g, l - delta)
        }
    });
    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;

    if avg_gain == 0.0 && avg_loss == 0.0 {
        return None;
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

pub fn true_range(current: &Candle, previous: Option<&Candle>) -> f64 {
    let high = current.high_f64();
    let low = current.low_f64();
    match previous {
        Some(prev) => {
            let prev_close = prev.close_f64();
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        }
        None => high - low,
    }
}

/// Average true range over the last `period` bars.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period;
    let total: f64 = (start..candles.len())
        .map(|i| true_range(&candles[i], Some(&candles[i - 1])))
        .sum();
    Some(total / period as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
    pub prev_histogram: f64,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if values.len() < 2 {
        return None;
    }
    let fast_ema = ema_series(values, fast);
    let slow_ema = ema_series(values, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&line, signal);
    let n = line.len();
    Some(Macd {
        line: line[n - 1],
        signal: signal_line[n - 1],
        histogram: line[n - 1] - signal_line[n - 1],
        prev_histogram: line[n - 2] - signal_line[n - 2],
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

impl Bands {
    /// Band width relative to the middle band.
    pub fn width(&self) -> f64 {
        if self.middle == 0.0 {
            return 0.0;
        }
        (self.upper - self.lower) / self.middle
    }
}

pub fn bollinger(values: &[f64], period: usize, k: f64) -> Option<Bands> {
    if values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let middle = mean(window)?;
    let std = sample_std(window)?;
    Some(Bands {
        lower: middle - k * std,
        middle,
        upper: middle + k * std,
    })
}

/// Volume-weighted typical price over the last `window` bars.
pub fn vwap(candles: &[Candle], window: usize) -> Option<f64> {
    if window == 0 || candles.len() < window {
        return None;
    }
    let (pv, vol) = candles[candles.len() - window..]
        .iter()
        .fold((0.0, 0.0), |(pv, vol), c| {
            let typical = (c.high_f64() + c.low_f64() + c.close_f64()) / 3.0;
            (pv + typical * c.volume_f64(), vol + c.volume_f64())
        });
    if vol <= 0.0 {
        return None;
    }
    Some(pv / vol)
}
