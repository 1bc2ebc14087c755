//! Moving-average trend strategies.

use super::indicators::{atr, closes, ema_series, rsi, sma};
use super::{finite, Signal, SignalError, SignalProvider};
use crate::market::Candle;

/// Crossover state between a fast and a slow average on the last two bars.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cross {
    Bullish,
    Bearish,
    None,
}

fn cross(prev_fast: f64, prev_slow: f64, fast: f64, slow: f64) -> Cross {
    if prev_fast <= prev_slow && fast > slow {
        Cross::Bullish
    } else if prev_fast >= prev_slow && fast < slow {
        Cross::Bearish
    } else {
        Cross::None
    }
}

/// Relative gap between averages scaled into a confidence.
fn separation_confidence(fast: f64, slow: f64) -> f64 {
    if slow == 0.0 {
        return 0.0;
    }
    ((fast - slow).abs() / slow * 20.0).min(1.0)
}

/// Simple moving average crossover.
#[derive(Debug, Clone)]
pub struct SmaCross {
    fast: usize,
    slow: usize,
}

impl SmaCross {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self { fast, slow }
    }
}

impl SignalProvider for SmaCross {
    fn name(&self) -> &'static str {
        "sma_cross"
    }

    fn min_lookback(&self) -> usize {
        self.fast.max(self.slow) + 1
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let prices = closes(history);
        let prev = &prices[..prices.len() - 1];

        let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
            sma(&prices, self.fast),
            sma(&prices, self.slow),
            sma(prev, self.fast),
            sma(prev, self.slow),
        ) else {
            return Ok(Signal::hold(0.0));
        };

        let confidence = finite(separation_confidence(fast, slow), "sma separation")?;
        Ok(match cross(prev_fast, prev_slow, fast, slow) {
            Cross::Bullish => Signal::buy(confidence).with_reason("SMA bullish cross"),
            Cross::Bearish => Signal::sell(confidence).with_reason("SMA bearish cross"),
            Cross::None => Signal::hold(confidence),
        })
    }
}

/// Exponential moving average crossover without filters.
#[derive(Debug, Clone)]
pub struct EmaCross {
    fast: usize,
    slow: usize,
}

impl EmaCross {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self { fast, slow }
    }
}

impl SignalProvider for EmaCross {
    fn name(&self) -> &'static str {
        "ema_cross"
    }

    fn min_lookback(&self) -> usize {
        self.fast.max(self.slow) + 1
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let prices = closes(history);
        let fast = ema_series(&prices, self.fast);
        let slow = ema_series(&prices, self.slow);
        let n = prices.len();

        let confidence = finite(separation_confidence(fast[n - 1], slow[n - 1]), "ema separation")?;
        Ok(match cross(fast[n - 2], slow[n - 2], fast[n - 1], slow[n - 1]) {
            Cross::Bullish => Signal::buy(confidence).with_reason("EMA bullish cross"),
            Cross::Bearish => Signal::sell(confidence).with_reason("EMA bearish cross"),
            Cross::None => Signal::hold(confidence),
        })
    }
}

/// EMA trend following, filtered by RSI extremes and scaled by trend strength.
#[derive(Debug, Clone)]
pub struct EmaRsiAtr {
    fast: usize,
    slow: usize,
    rsi_period: usize,
    atr_period: usize,
}

impl EmaRsiAtr {
    pub fn new(fast: usize, slow: usize, rsi_period: usize, atr_period: usize) -> Self {
        Self {
            fast,
            slow,
            rsi_period,
            atr_period,
        }
    }
}

impl SignalProvider for EmaRsiAtr {
    fn name(&self) -> &'static str {
        "ema_rsi_atr"
    }

    fn min_lookback(&self) -> usize {
        self.fast
            .max(self.slow)
            .max(self.rsi_period)
            .max(self.atr_period)
            + 1
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let prices = closes(history);
        let n = prices.len();
        let fast = ema_series(&prices, self.fast);
        let slow = ema_series(&prices, self.slow);

        let (Some(rsi), Some(atr)) = (rsi(&prices, self.rsi_period), atr(history, self.atr_period))
        else {
            return Ok(Signal::hold(0.0));
        };
        // No volatility means no tradeable trend.
        if atr <= 0.0 {
            return Ok(Signal::hold(0.0));
        }

        let (f, s) = (fast[n - 1], slow[n - 1]);
        let crossed = cross(fast[n - 2], slow[n - 2], f, s);

        let strength = if s == 0.0 { 0.0 } else { (f - s).abs() / s };
        let rsi_centered = 1.0 - (rsi - 50.0).abs() / 50.0;
        let mut confidence = finite((strength * 10.0).min(rsi_centered), "ema/rsi confidence")?;
        if crossed != Cross::None {
            confidence = (confidence * 2.0).min(1.0);
        }

        let reason = format!("rsi={:.1} atr={:.4}", rsi, atr);
        if f > s && rsi < 85.0 {
            if (40.0..80.0).contains(&rsi) || crossed == Cross::Bullish {
                confidence = confidence.max(0.6);
            }
            return Ok(Signal::buy(confidence.clamp(0.0, 1.0)).with_reason(reason));
        }
        if f < s && rsi > 15.0 {
            if (rsi > 20.0 && rsi < 60.0) || crossed == Cross::Bearish {
                confidence = confidence.max(0.6);
            }
            return Ok(Signal::sell(confidence.clamp(0.0, 1.0)).with_reason(reason));
        }
        Ok(Signal::hold(confidence.clamp(0.0, 1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::Side;

    fn v_shape() -> Vec<f64> {
        // long decline then sharp recovery forces a bullish cross on the last bar region
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        closes.extend((1..=30).map(|i| 141.0 + 3.0 * i as f64));
        closes
    }

    fn first_side_change(provider: &dyn SignalProvider, closes: &[f64]) -> Option<(usize, Side)> {
        let candles = candles_from_closes(closes);
        (provider.min_lookback()..=candles.len()).find_map(|end| {
            let s = provider.evaluate(&candles[..end]).unwrap();
            (s.side != Side::Hold).then_some((end - 1, s.side))
        })
    }

    #[test]
    fn test_sma_cross_detects_recovery() {
        let provider = SmaCross::new(5, 20);
        let (_, side) = first_side_change(&provider, &v_shape()).unwrap();
        assert_eq!(side, Side::Buy);
    }

    #[test]
    fn test_ema_cross_detects_recovery() {
        let provider = EmaCross::new(5, 20);
        let (bar, side) = first_side_change(&provider, &v_shape()).unwrap();
        assert_eq!(side, Side::Buy);
        assert!(bar >= 60);
    }

    #[test]
    fn test_ema_cross_sells_on_breakdown() {
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        closes.extend((1..=20).map(|i| 159.0 - 4.0 * i as f64));
        let (_, side) = first_side_change(&EmaCross::new(5, 20), &closes).unwrap();
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_short_history_holds() {
        let candles = candles_from_closes(&[1.0, 2.0, 3.0]);
        let s = EmaRsiAtr::new(12, 26, 14, 14).evaluate(&candles).unwrap();
        assert_eq!(s.side, Side::Hold);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn test_ema_rsi_atr_follows_uptrend() {
        // steady uptrend with small pullbacks keeps RSI out of the overbought band
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + i as f64 * 0.5 + if i % 3 == 0 { -2.0 } else { 0.0 })
            .collect();
        let candles = candles_from_closes(&closes);
        let s = EmaRsiAtr::new(12, 26, 14, 14).evaluate(&candles).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert!(s.confidence >= 0.6);
    }
}
