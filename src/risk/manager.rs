//! Exit checks and entry sizing.

use crate::config::{PositionSizing, RiskConfig};
use crate::market::Candle;
use crate::strategy::indicators::atr;
use crate::strategy::Signal;
use crate::utils::decimal::{from_f64, round_down_to_lot, safe_div, to_f64};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a position was force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// Price levels fixed when a position is opened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub stop: Decimal,
    pub target: Decimal,
}

/// Stateless rules evaluated by the engine on every bar.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Strictly above the configured minimum.
    pub fn passes_confidence(&self, signal: &Signal) -> bool {
        signal.confidence > self.config.min_confidence
    }

    /// Stop and target for an entry at `entry_price`.
    ///
    /// With ATR stops configured the levels are `entry ∓ multiplier × ATR`
    /// over `history`; when ATR is unavailable or zero the percentage levels
    /// are used instead.
    pub fn exit_levels(&self, entry_price: Decimal, history: &[Candle]) -> ExitLevels {
        let percent = ExitLevels {
            stop: entry_price * (Decimal::ONE - self.config.stop_loss_pct),
            target: entry_price * (Decimal::ONE + self.config.take_profit_pct),
        };

        let Some(atr_config) = &self.config.atr_stops else {
            return percent;
        };
        let Some(atr) = atr(history, atr_config.period).filter(|a| *a > 0.0) else {
            debug!(entry = %entry_price, "ATR unavailable, using percentage stops");
            return percent;
        };
        match (
            from_f64(atr_config.stop_multiplier * atr),
            from_f64(atr_config.target_multiplier * atr),
        ) {
            (Some(stop_offset), Some(target_offset)) => ExitLevels {
                stop: (entry_price - stop_offset).max(Decimal::ZERO),
                target: entry_price + target_offset,
            },
            _ => percent,
        }
    }

    /// Stop-loss takes priority over take-profit.
    pub fn check_exit(&self, levels: &ExitLevels, mark: Decimal) -> Option<ExitReason> {
        if mark <= levels.stop {
            Some(ExitReason::StopLoss)
        } else if mark >= levels.target {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    /// Share of equity to commit for a signal of this confidence.
    pub fn position_fraction(&self, confidence: f64) -> Decimal {
        match self.config.sizing {
            PositionSizing::Fixed => self.config.position_size_pct,
            PositionSizing::ConfidenceScaled {
                scale,
                max_fraction,
            } => from_f64(confidence)
                .map(|c| (c * scale).min(max_fraction).max(Decimal::ZERO))
                .unwrap_or(Decimal::ZERO),
        }
    }

    /// Quantity for a new entry, or `None` when the entry must be skipped.
    ///
    /// `position` is the total quantity already held; equity is marked at
    /// `price`. The quantity is rounded down to the configured step and the
    /// entry is rejected if cash cannot cover its value plus commission.
    pub fn entry_size(
        &self,
        cash: Decimal,
        position: Decimal,
        price: Decimal,
        confidence: f64,
        commission_rate: Decimal,
    ) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        let equity = cash + position * price;
        let position_value = equity * self.position_fraction(confidence);
        let quantity = round_down_to_lot(safe_div(position_value, price), self.config.quantity_step);

        if quantity <= Decimal::ZERO {
            debug!(equity = %equity, price = %price, "Entry size rounds to zero");
            return None;
        }
        if cash < position_value * (Decimal::ONE + commission_rate) {
            debug!(
                cash = %cash,
                position_value = %position_value,
                "Entry rejected: insufficient cash"
            );
            return None;
        }
        Some(quantity)
    }

    /// Unrealized return of a long entry, as a fraction.
    pub fn pnl_pct(entry_price: Decimal, mark: Decimal) -> f64 {
        to_f64(safe_div(mark - entry_price, entry_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtrStopConfig;
    use crate::strategy::test_support::candles_from_closes;
    use rust_decimal_macros::dec;

    fn create_test_manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    // =========================================================================
    // Exit Tests
    // =========================================================================

    #[test]
    fn test_percentage_exits() {
        let rm = create_test_manager();
        let levels = rm.exit_levels(dec!(100), &[]);
        assert_eq!(levels.stop, dec!(97));
        assert_eq!(levels.target, dec!(106));

        assert_eq!(rm.check_exit(&levels, dec!(97)), Some(ExitReason::StopLoss));
        assert_eq!(rm.check_exit(&levels, dec!(90)), Some(ExitReason::StopLoss));
        assert_eq!(rm.check_exit(&levels, dec!(106)), Some(ExitReason::TakeProfit));
        assert_eq!(rm.check_exit(&levels, dec!(100)), None);
        assert_eq!(rm.check_exit(&levels, dec!(97.01)), None);
    }

    #[test]
    fn test_atr_exits() {
        let config = RiskConfig {
            atr_stops: Some(AtrStopConfig {
                period: 14,
                stop_multiplier: 2.0,
                target_multiplier: 3.0,
            }),
            ..RiskConfig::default()
        };
        let rm = RiskManager::new(config);
        // flat closes at 100 with a 1.0 high-low range per bar
        let history = candles_from_closes(&[100.0; 20]);
        let levels = rm.exit_levels(dec!(100), &history);
        assert_eq!(levels.stop, dec!(98));
        assert_eq!(levels.target, dec!(103));

        // not enough bars for ATR falls back to percentages
        let levels = rm.exit_levels(dec!(100), &history[..5]);
        assert_eq!(levels.stop, dec!(97));
    }

    // =========================================================================
    // Sizing Tests
    // =========================================================================

    #[test]
    fn test_fixed_entry_size() {
        let rm = create_test_manager();
        let qty = rm
            .entry_size(dec!(10000), Decimal::ZERO, dec!(100), 0.8, dec!(0.001))
            .unwrap();
        assert_eq!(qty, dec!(40));
    }

    #[test]
    fn test_entry_rounds_down_to_step() {
        let rm = create_test_manager();
        let qty = rm
            .entry_size(dec!(10000), Decimal::ZERO, dec!(30000), 0.8, Decimal::ZERO)
            .unwrap();
        // 4000 / 30000 = 0.13333...
        assert_eq!(qty, dec!(0.1333));
    }

    #[test]
    fn test_entry_rejected_when_cash_short() {
        let rm = create_test_manager();
        // equity 10000 but only 1000 in cash
        assert!(rm
            .entry_size(dec!(1000), dec!(90), dec!(100), 0.9, dec!(0.001))
            .is_none());
        // position value exactly equals cash but commission pushes it over
        let config = RiskConfig {
            position_size_pct: Decimal::ONE,
            ..RiskConfig::default()
        };
        assert!(RiskManager::new(config)
            .entry_size(dec!(1000), Decimal::ZERO, dec!(10), 0.9, dec!(0.001))
            .is_none());
    }

    #[test]
    fn test_confidence_scaled_fraction() {
        let config = RiskConfig {
            sizing: PositionSizing::ConfidenceScaled {
                scale: dec!(0.5),
                max_fraction: dec!(0.45),
            },
            ..RiskConfig::default()
        };
        let rm = RiskManager::new(config);
        assert_eq!(rm.position_fraction(0.8), dec!(0.4));
        assert_eq!(rm.position_fraction(1.0), dec!(0.45));
        assert_eq!(rm.position_fraction(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn test_confidence_threshold_is_strict() {
        let rm = create_test_manager();
        assert!(!rm.passes_confidence(&Signal::buy(0.70)));
        assert!(rm.passes_confidence(&Signal::buy(0.71)));
    }
}
