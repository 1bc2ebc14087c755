//! Momentum and order-flow heuristics.

use super::indicators::{bollinger, closes, ema_series, macd, mean, rsi, sample_std, sma, volumes};
use super::{finite, Signal, SignalError, SignalProvider};
use crate::market::Candle;

/// RSI + MACD + SMA trend + volume spike voting. Needs three agreeing votes.
#[derive(Debug, Clone)]
pub struct MomentumStrategy {
    pub rsi_period: usize,
    pub volume_spike: f64,
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            volume_spike: 1.5,
        }
    }
}

#[derive(Default)]
struct Votes {
    count: u32,
    weight: f64,
}

impl Votes {
    fn add(&mut self, condition: bool, weight: f64) {
        if condition {
            self.count += 1;
            self.weight += weight;
        }
    }

    fn decisive(&self) -> bool {
        self.count >= 3 && self.weight > 0.6
    }
}

impl SignalProvider for MomentumStrategy {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn min_lookback(&self) -> usize {
        50
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let prices = closes(history);
        let vols = volumes(history);

        let (Some(rsi), Some(macd), Some(sma20), Some(volume_ma)) = (
            rsi(&prices, self.rsi_period),
            macd(&prices, 12, 26, 9),
            sma(&prices, 20),
            sma(&vols, 20),
        ) else {
            return Ok(Signal::hold(0.0));
        };
        let macd_line = finite(macd.line, "macd")?;
        let price = prices[prices.len() - 1];
        let spike = vols[vols.len() - 1] > volume_ma * self.volume_spike;

        let mut buy = Votes::default();
        buy.add(
            macd_line > macd.signal && macd.histogram > 0.0 && macd.prev_histogram <= 0.0,
            0.3,
        );
        buy.add(macd_line > 0.0 && macd.histogram > 0.0, 0.2);
        buy.add(price > sma20, 0.2);
        buy.add(rsi > 40.0 && rsi < 70.0, 0.2);
        buy.add(spike, 0.1);

        let mut sell = Votes::default();
        sell.add(
            macd_line < macd.signal && macd.histogram < 0.0 && macd.prev_histogram >= 0.0,
            0.3,
        );
        sell.add(macd_line < 0.0 && macd.histogram < 0.0, 0.2);
        sell.add(price < sma20, 0.2);
        sell.add(!(30.0..=70.0).contains(&rsi), 0.2);
        sell.add(spike, 0.1);

        if buy.decisive() {
            return Ok(Signal::buy(buy.weight.min(0.95))
                .with_reason(format!("{} bullish votes", buy.count)));
        }
        if sell.decisive() {
            return Ok(Signal::sell(sell.weight.min(0.95))
                .with_reason(format!("{} bearish votes", sell.count)));
        }
        Ok(Signal::hold(0.2))
    }
}

/// Follow one-bar moves above 1 % or two consecutive moves above 0.5 %.
#[derive(Debug, Clone, Copy)]
pub struct PriceAction;

impl SignalProvider for PriceAction {
    fn name(&self) -> &'static str {
        "price_action"
    }

    fn min_lookback(&self) -> usize {
        3
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        let n = history.len();
        if n < 3 {
            return Ok(Signal::hold(0.0));
        }
        let (c0, c1, c2) = (
            history[n - 3].close_f64(),
            history[n - 2].close_f64(),
            history[n - 1].close_f64(),
        );
        let change = finite((c2 - c1) / c1, "price change")?;
        let prev_change = finite((c1 - c0) / c0, "price change")?;

        let signal = if change > 0.01 {
            Signal::buy(0.7).with_reason("breakout bar")
        } else if change < -0.01 {
            Signal::sell(0.7).with_reason("breakdown bar")
        } else if change > 0.005 && prev_change > 0.005 {
            Signal::buy(0.6).with_reason("two rising bars")
        } else if change < -0.005 && prev_change < -0.005 {
            Signal::sell(0.6).with_reason("two falling bars")
        } else {
            Signal::hold(0.1)
        };
        Ok(signal)
    }
}

const BOT_LOOKBACK: usize = 20;

/// Heuristics for trading around algorithmic order flow: band fades,
/// volume-backed momentum, stop-hunt reversals and quiet-tape trend following.
/// The strongest candidate reason wins.
#[derive(Debug, Clone)]
pub struct BotHunter {
    pub rsi_period: usize,
}

impl Default for BotHunter {
    fn default() -> Self {
        Self { rsi_period: 14 }
    }
}

impl BotHunter {
    /// Activity score in [0, 1] for the last bar of `history`.
    fn activity(history: &[Candle]) -> f64 {
        if history.len() < BOT_LOOKBACK + 1 {
            return 0.0;
        }
        let window = &history[history.len() - BOT_LOOKBACK..];
        let vols = volumes(window);
        let last_vol = vols[vols.len() - 1];
        let vol_z = match (mean(&vols), sample_std(&vols)) {
            (Some(m), Some(s)) => (last_vol - m) / (s + 1e-10),
            _ => 0.0,
        };

        let changes: Vec<f64> = history[history.len() - BOT_LOOKBACK - 1..]
            .windows(2)
            .map(|w| {
                let prev = w[0].close_f64();
                if prev == 0.0 {
                    0.0
                } else {
                    ((w[1].close_f64() - prev) / prev).abs()
                }
            })
            .collect();
        let last_change = changes[changes.len() - 1];
        let avg_change = mean(&changes).unwrap_or(0.0);
        let change_std = sample_std(&changes).unwrap_or(0.0);
        let regularity = (1.0 / (change_std + 0.001)).clamp(0.0, 100.0) / 100.0;

        let close = window[window.len() - 1].close_f64();
        let recent_low = window[window.len().saturating_sub(5)..]
            .iter()
            .map(Candle::low_f64)
            .fold(f64::INFINITY, f64::min);

        let mut score = 0.0;
        if vol_z > 2.0 {
            score += 0.3;
        }
        if last_change > avg_change * 2.0 {
            score += 0.3;
        }
        score += regularity * 0.2;
        if recent_low < close * 0.98 {
            score += 0.2;
        }
        score
    }
}

impl SignalProvider for BotHunter {
    fn name(&self) -> &'static str {
        "bot_hunter"
    }

    fn min_lookback(&self) -> usize {
        50
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let prices = closes(history);
        let vols = volumes(history);
        let n = prices.len();

        let (Some(rsi), Some(bands), Some(volume_ma)) = (
            rsi(&prices, self.rsi_period),
            bollinger(&prices, 20, 2.0),
            sma(&vols, 20),
        ) else {
            return Ok(Signal::hold(0.0));
        };
        let price = prices[n - 1];
        let band_span = bands.upper - bands.lower + 1e-10;
        let width = finite(bands.width(), "bollinger width")?;
        let volume_ratio = vols[n - 1] / (volume_ma + 1e-10);

        let fast = ema_series(&prices, 12);
        let slow = ema_series(&prices, 26);
        let bullish = fast[n - 1] > slow[n - 1];
        let bearish = fast[n - 1] < slow[n - 1];
        let bullish_cross = fast[n - 2] <= slow[n - 2] && bullish;
        let bearish_cross = fast[n - 2] >= slow[n - 2] && bearish;

        let recent = &history[n - 5..];
        let recent_low = recent.iter().map(Candle::low_f64).fold(f64::INFINITY, f64::min);
        let recent_high = recent.iter().map(Candle::high_f64).fold(f64::NEG_INFINITY, f64::max);
        let recovery = (price - recent_low) / (recent_high - recent_low + 1e-10);

        let activity = Self::activity(history);
        let prev_activity = Self::activity(&history[..n - 1]);
        let activity_fading = activity < prev_activity && prev_activity > 0.3;
        let quiet = activity_fading || activity < 0.4;
        let volume_spike = volume_ratio > 1.3;

        let mut buys: Vec<(&str, f64)> = Vec::new();
        let mut sells: Vec<(&str, f64)> = Vec::new();

        if (price <= bands.lower * 1.01 || rsi < 35.0) && rsi < 40.0 && width > 0.01 {
            let rsi_factor = ((40.0 - rsi) / 40.0).max(0.0);
            let band_factor = ((bands.lower - price) / band_span).max(0.0);
            buys.push(("band fade", (0.4 + rsi_factor * 0.3 + band_factor * 0.15).min(0.85)));
        }
        if (volume_spike || bullish_cross || bullish)
            && rsi > 35.0
            && rsi < 75.0
            && price > bands.middle * 0.995
        {
            let vol_factor = if volume_spike {
                ((volume_ratio - 1.0) / 0.5).min(1.0)
            } else {
                0.3
            };
            let ema_factor = if bullish_cross {
                0.4
            } else if bullish {
                0.2
            } else {
                0.1
            };
            buys.push(("volume momentum", (0.4 + vol_factor * 0.3 + ema_factor * 0.2).min(0.90)));
        }
        if recent_low < price * 0.995 && recovery > 0.3 && rsi < 55.0 {
            let factor = (recovery - 0.3).max(0.0) / 0.7;
            buys.push(("stop-hunt reversal", (0.4 + factor * 0.4).min(0.80)));
        }
        if quiet && (bullish || price > bands.middle) && rsi > 40.0 && rsi < 70.0 {
            let factor = if activity_fading {
                (prev_activity - activity).max(0.0)
            } else {
                0.3
            };
            buys.push(("activity fade", (0.4 + factor * 0.35).min(0.75)));
        }

        if (price >= bands.upper * 0.99 || rsi > 65.0) && rsi > 60.0 && width > 0.01 {
            sells.push(("band fade", (0.5 + (rsi - 70.0) / 30.0 * 0.35).min(0.85)));
        }
        if (volume_spike || bearish_cross || bearish)
            && rsi < 65.0
            && rsi > 25.0
            && price < bands.middle * 1.005
        {
            sells.push(("volume momentum", (0.6 + volume_ratio / 3.0 * 0.3).min(0.90)));
        }
        if recent_high > price * 1.005 && recovery < 0.7 && rsi > 45.0 {
            sells.push(("stop-hunt reversal", (0.5 + (1.0 - recovery) * 0.3).min(0.80)));
        }
        if quiet && (bearish || price < bands.middle) && rsi < 60.0 && rsi > 30.0 {
            sells.push(("activity fade", (0.5 + (prev_activity - activity) * 0.5).min(0.75)));
        }

        fn strongest<'a>(candidates: &[(&'a str, f64)]) -> Option<(&'a str, f64)> {
            candidates
                .iter()
                .copied()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        }

        if let Some((reason, confidence)) = strongest(&buys) {
            return Ok(Signal::buy(finite(confidence, "bot hunter confidence")?.clamp(0.0, 1.0))
                .with_reason(reason));
        }
        if let Some((reason, confidence)) = strongest(&sells) {
            return Ok(Signal::sell(finite(confidence, "bot hunter confidence")?.clamp(0.0, 1.0))
                .with_reason(reason));
        }
        if activity > 0.7 {
            return Ok(Signal::hold(0.3).with_reason("heavy bot activity"));
        }
        Ok(Signal::hold(0.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{candles_from_closes, candles_with_volume};
    use crate::strategy::Side;

    #[test]
    fn test_price_action_breakout() {
        let s = PriceAction.evaluate(&candles_from_closes(&[100.0, 100.0, 101.5])).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.confidence, 0.7);

        let s = PriceAction.evaluate(&candles_from_closes(&[100.0, 100.6, 101.2])).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.confidence, 0.6);

        let s = PriceAction.evaluate(&candles_from_closes(&[100.0, 100.0, 98.0])).unwrap();
        assert_eq!(s.side, Side::Sell);
    }

    #[test]
    fn test_momentum_needs_history() {
        let s = MomentumStrategy::default()
            .evaluate(&candles_from_closes(&[100.0; 10]))
            .unwrap();
        assert_eq!(s.side, Side::Hold);
    }

    #[test]
    fn test_momentum_buys_accelerating_trend_on_volume() {
        // flat base, then +2/-1 zigzag rally ending on an up bar with a volume spike
        let mut closes = vec![100.0; 40];
        let mut price = 100.0;
        for step in 1..=21 {
            price += if step % 2 == 1 { 2.0 } else { -1.0 };
            closes.push(price);
        }
        let mut vols = vec![100.0; closes.len()];
        *vols.last_mut().unwrap() = 400.0;

        let s = MomentumStrategy::default()
            .evaluate(&candles_with_volume(&closes, &vols))
            .unwrap();
        assert_eq!(s.side, Side::Buy);
        assert!(s.confidence > 0.6 && s.confidence <= 0.95);
    }

    #[test]
    fn test_bot_hunter_confidence_in_range() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0)
            .collect();
        let candles = candles_from_closes(&closes);
        let provider = BotHunter::default();
        for end in provider.min_lookback()..=candles.len() {
            let s = provider.evaluate(&candles[..end]).unwrap();
            assert!(s.validate().is_ok());
        }
    }
}
