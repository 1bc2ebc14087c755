//! Camarilla pivot support/resistance entries.

use super::{EntryPlan, ExitTarget, Signal, SignalError, SignalProvider};
use crate::market::Candle;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Band for "price crossed into the support zone".
const ZONE_THRESHOLD: Decimal = dec!(0.005);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CamarillaLevels {
    pub pivot: Decimal,
    pub r1: Decimal,
    pub r2: Decimal,
    pub r3: Decimal,
    pub r4: Decimal,
    pub s1: Decimal,
    pub s2: Decimal,
    pub s3: Decimal,
    pub s4: Decimal,
}

impl CamarillaLevels {
    /// Levels from a session's high, low and close: `C ± (H − L) × 1.1 / {12, 6, 4, 2}`.
    pub fn new(high: Decimal, low: Decimal, close: Decimal) -> Self {
        let range = (high - low) * dec!(1.1);
        Self {
            pivot: (high + low + close) / dec!(3),
            r1: close + range / dec!(12),
            r2: close + range / dec!(6),
            r3: close + range / dec!(4),
            r4: close + range / dec!(2),
            s1: close - range / dec!(12),
            s2: close - range / dec!(6),
            s3: close - range / dec!(4),
            s4: close - range / dec!(2),
        }
    }

    /// Levels from the aggregate of `session`; `None` when empty.
    pub fn from_session(session: &[Candle]) -> Option<Self> {
        let last = session.last()?;
        let high = session.iter().map(|c| c.high).max()?;
        let low = session.iter().map(|c| c.low).min()?;
        Some(Self::new(high, low, last.close))
    }
}

/// Buys when price drops into the S3 or S2 zone of the previous session and
/// attaches an exit ladder the engine manages per entry.
///
/// S3 entries take half off at R1 and the rest at R2; S2 entries exit in full
/// at R3. The levels come from the `window` bars before the previous bar's
/// close, so the current bar never contributes to its own levels.
#[derive(Debug, Clone)]
pub struct PivotLevels {
    window: usize,
}

impl PivotLevels {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn levels(&self, history: &[Candle]) -> Option<CamarillaLevels> {
        let n = history.len();
        if n < self.window + 1 {
            return None;
        }
        CamarillaLevels::from_session(&history[n - 1 - self.window..n - 1])
    }
}

impl Default for PivotLevels {
    fn default() -> Self {
        Self::new(24)
    }
}

fn crossed_into(prev: Decimal, current: Decimal, level: Decimal) -> bool {
    let zone = level * (Decimal::ONE + ZONE_THRESHOLD);
    level > Decimal::ZERO && prev > zone && current <= zone
}

impl SignalProvider for PivotLevels {
    fn name(&self) -> &'static str {
        "pivot_levels"
    }

    fn min_lookback(&self) -> usize {
        50.max(self.window + 2)
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        let n = history.len();
        if n < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let Some(levels) = self.levels(history) else {
            return Ok(Signal::hold(0.0));
        };
        let prev = history[n - 2].close;
        let current = history[n - 1].close;

        if crossed_into(prev, current, levels.s3) {
            let plan = EntryPlan {
                tag: "S3".to_string(),
                targets: vec![
                    ExitTarget {
                        label: "R1".to_string(),
                        price: levels.r1,
                        fraction: dec!(0.5),
                    },
                    ExitTarget {
                        label: "R2".to_string(),
                        price: levels.r2,
                        fraction: dec!(0.5),
                    },
                ],
            };
            return Ok(Signal::buy(0.95)
                .with_reason(format!("crossed into S3 {}", levels.s3.round_dp(2)))
                .with_entry(plan));
        }
        if crossed_into(prev, current, levels.s2) {
            let plan = EntryPlan {
                tag: "S2".to_string(),
                targets: vec![ExitTarget {
                    label: "R3".to_string(),
                    price: levels.r3,
                    fraction: Decimal::ONE,
                }],
            };
            return Ok(Signal::buy(0.85)
                .with_reason(format!("crossed into S2 {}", levels.s2.round_dp(2)))
                .with_entry(plan));
        }
        Ok(Signal::hold(0.3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::Side;

    #[test]
    fn test_camarilla_formula() {
        let l = CamarillaLevels::new(dec!(110), dec!(90), dec!(100));
        // range 20 × 1.1 = 22
        assert_eq!(l.r4, dec!(111));
        assert_eq!(l.r3, dec!(105.5));
        assert_eq!(l.s3, dec!(94.5));
        assert_eq!(l.s4, dec!(89));
        assert!(l.s1 < l.pivot && l.pivot < l.r1);
    }

    /// Oscillating session around 100 followed by `last` as the current close.
    fn session_then(last: &[f64]) -> Vec<Candle> {
        let mut closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + if i % 2 == 0 { 4.0 } else { -4.0 })
            .collect();
        closes.push(100.0);
        closes.extend_from_slice(last);
        candles_from_closes(&closes)
    }

    #[test]
    fn test_s3_entry_carries_ladder() {
        let provider = PivotLevels::new(24);
        let history = session_then(&[93.0]);
        let levels = provider.levels(&history).unwrap();
        assert!(Decimal::from(93) <= levels.s3 * dec!(1.005));

        let s = provider.evaluate(&history).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.confidence, 0.95);
        let plan = s.entry.unwrap();
        assert_eq!(plan.tag, "S3");
        assert_eq!(plan.targets.len(), 2);
        assert_eq!(plan.targets[0].price, levels.r1);
        assert_eq!(plan.targets[1].price, levels.r2);
    }

    #[test]
    fn test_s2_entry_targets_r3() {
        let provider = PivotLevels::new(24);
        let history = session_then(&[98.5]);
        let s = provider.evaluate(&history).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.confidence, 0.85);
        let plan = s.entry.unwrap();
        assert_eq!(plan.tag, "S2");
        assert_eq!(plan.targets[0].label, "R3");
        assert_eq!(plan.targets[0].fraction, Decimal::ONE);
    }

    #[test]
    fn test_no_entry_above_supports() {
        let s = PivotLevels::new(24).evaluate(&session_then(&[100.5])).unwrap();
        assert_eq!(s.side, Side::Hold);
        assert_eq!(s.confidence, 0.3);
    }
}
