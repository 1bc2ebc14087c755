//! Mean-reversion strategies: fade moves away from a reference price.

use super::indicators::{closes, rsi, sma, vwap};
use super::{finite, Signal, SignalError, SignalProvider};
use crate::market::Candle;

const MA_PERIOD: usize = 20;
const MA_DISTANCE: f64 = 0.015;
const VWAP_THRESHOLD_PCT: f64 = 0.3;

/// Buy 1.5 % below the 20-bar mean with soft RSI, sell 1.5 % above with firm RSI.
#[derive(Debug, Clone)]
pub struct MeanReversion {
    rsi_period: usize,
}

impl MeanReversion {
    pub fn new(rsi_period: usize) -> Self {
        Self { rsi_period }
    }
}

impl SignalProvider for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn min_lookback(&self) -> usize {
        MA_PERIOD.max(self.rsi_period + 1)
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        let prices = closes(history);
        let (Some(ma), Some(&price)) = (sma(&prices, MA_PERIOD), prices.last()) else {
            return Ok(Signal::hold(0.0));
        };
        if ma <= 0.0 {
            return Ok(Signal::hold(0.0));
        }
        let distance = finite((price - ma) / ma, "ma distance")?;
        let rsi = rsi(&prices, self.rsi_period).unwrap_or(50.0);

        if distance < -MA_DISTANCE && rsi < 50.0 {
            return Ok(Signal::buy(0.75).with_reason(format!("{:.2}% below MA20", distance * 100.0)));
        }
        if distance > MA_DISTANCE && rsi > 50.0 {
            return Ok(Signal::sell(0.75).with_reason(format!("{:.2}% above MA20", distance * 100.0)));
        }
        Ok(Signal::hold(0.1))
    }
}

/// Fade deviations from a rolling VWAP.
#[derive(Debug, Clone)]
pub struct VwapReversion {
    window: usize,
}

impl VwapReversion {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }
}

impl SignalProvider for VwapReversion {
    fn name(&self) -> &'static str {
        "vwap"
    }

    fn min_lookback(&self) -> usize {
        self.window
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        let (Some(vwap), Some(last)) = (vwap(history, self.window), history.last()) else {
            return Ok(Signal::hold(0.0));
        };
        let distance_pct = finite((last.close_f64() - vwap) / vwap * 100.0, "vwap distance")?;
        let confidence = (distance_pct.abs() / 2.0).min(0.95);

        if distance_pct < -VWAP_THRESHOLD_PCT {
            return Ok(Signal::buy(confidence).with_reason(format!("{:.2}% under VWAP", distance_pct)));
        }
        if distance_pct > VWAP_THRESHOLD_PCT {
            return Ok(Signal::sell(confidence).with_reason(format!("{:.2}% over VWAP", distance_pct)));
        }
        Ok(Signal::hold(0.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::Side;

    #[test]
    fn test_mean_reversion_buys_dip() {
        let mut closes = vec![100.0; 20];
        closes.extend([99.0, 98.0, 97.0]);
        let s = MeanReversion::new(14).evaluate(&candles_from_closes(&closes)).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.confidence, 0.75);
    }

    #[test]
    fn test_mean_reversion_sells_spike() {
        let mut closes = vec![100.0; 20];
        closes.extend([101.0, 102.0, 104.0]);
        let s = MeanReversion::new(14).evaluate(&candles_from_closes(&closes)).unwrap();
        assert_eq!(s.side, Side::Sell);
    }

    #[test]
    fn test_vwap_confidence_scales_with_distance() {
        let mut closes = vec![100.0; 23];
        closes.push(98.0);
        let s = VwapReversion::new(24).evaluate(&candles_from_closes(&closes)).unwrap();
        assert_eq!(s.side, Side::Buy);
        // roughly 1.9 % under VWAP
        assert!(s.confidence > 0.9 && s.confidence <= 0.95);
    }

    #[test]
    fn test_vwap_inside_band_holds() {
        let mut closes = vec![100.0; 23];
        closes.push(100.1);
        let s = VwapReversion::new(24).evaluate(&candles_from_closes(&closes)).unwrap();
        assert_eq!(s.side, Side::Hold);
    }
}
