//! Paper exchange for backtesting.
//!
//! Holds the authoritative cash/position state of one run and fills market
//! orders immediately at the requested price. Requested quantities are never
//! rejected, only clipped to what cash or the open position allows.

use crate::utils::decimal::{round_down_to_lot, safe_div};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Errors raised for broken preconditions, never for quantities.
#[derive(Debug, Error, PartialEq)]
pub enum ExchangeError {
    #[error("fill price must be positive, got {0}")]
    InvalidPrice(Decimal),
    #[error("starting cash must be non-negative, got {0}")]
    NegativeCash(Decimal),
    #[error("commission rate must be in [0, 1), got {0}")]
    InvalidCommission(Decimal),
    #[error("lot size must be positive, got {0}")]
    InvalidLotSize(Decimal),
}

/// Outcome of one market order. A zero-quantity fill is a valid no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    /// quantity × price
    pub notional: Decimal,
    pub fee: Decimal,
    /// Signed change in cash: negative for buys, positive for sells.
    pub cash_delta: Decimal,
}

impl Fill {
    fn empty(side: OrderSide, price: Decimal) -> Self {
        Self {
            side,
            quantity: Decimal::ZERO,
            price,
            notional: Decimal::ZERO,
            fee: Decimal::ZERO,
            cash_delta: Decimal::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Simulated single-instrument venue.
#[derive(Debug, Clone)]
pub struct PaperExchange {
    cash: Decimal,
    position: Decimal,
    avg_entry_price: Option<Decimal>,
    commission_rate: Decimal,
    lot_size: Decimal,
    fees_paid: Decimal,
    order_count: u64,
}

impl PaperExchange {
    /// Create an exchange with no commission and whole-unit clipping.
    pub fn new(starting_cash: Decimal) -> Result<Self, ExchangeError> {
        if starting_cash < Decimal::ZERO {
            return Err(ExchangeError::NegativeCash(starting_cash));
        }

        Ok(Self {
            cash: starting_cash,
            position: Decimal::ZERO,
            avg_entry_price: None,
            commission_rate: Decimal::ZERO,
            lot_size: Decimal::ONE,
            fees_paid: Decimal::ZERO,
            order_count: 0,
        })
    }

    /// Charge `rate × notional` on every fill.
    pub fn with_commission(mut self, rate: Decimal) -> Result<Self, ExchangeError> {
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(ExchangeError::InvalidCommission(rate));
        }
        self.commission_rate = rate;
        Ok(self)
    }

    /// Granularity used when a buy has to be clipped to available cash.
    pub fn with_lot_size(mut self, lot_size: Decimal) -> Result<Self, ExchangeError> {
        if lot_size <= Decimal::ZERO {
            return Err(ExchangeError::InvalidLotSize(lot_size));
        }
        self.lot_size = lot_size;
        Ok(self)
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self) -> Decimal {
        self.position
    }

    /// Undefined (None) while flat.
    pub fn avg_entry_price(&self) -> Option<Decimal> {
        self.avg_entry_price
    }

    pub fn commission_rate(&self) -> Decimal {
        self.commission_rate
    }

    pub fn fees_paid(&self) -> Decimal {
        self.fees_paid
    }

    /// Number of market orders issued, including zero-quantity ones.
    pub fn order_count(&self) -> u64 {
        self.order_count
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_zero()
    }

    /// Cash plus position marked at `mark_price`.
    pub fn equity(&self, mark_price: Decimal) -> Decimal {
        self.cash + self.position * mark_price
    }

    /// `(mark − avg_entry) × position` while long, zero otherwise.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        match self.avg_entry_price {
            Some(avg) if self.position > Decimal::ZERO => (mark_price - avg) * self.position,
            _ => Decimal::ZERO,
        }
    }

    /// Buy up to `quantity` at `price`, clipped to what cash covers.
    pub fn market_buy(&mut self, quantity: Decimal, price: Decimal) -> Result<Fill, ExchangeError> {
        ensure_price(price)?;
        self.order_count += 1;

        let unit_cost = price * (Decimal::ONE + self.commission_rate);
        let mut quantity = quantity.max(Decimal::ZERO);

        if quantity * unit_cost > self.cash {
            quantity = round_down_to_lot(safe_div(self.cash, unit_cost), self.lot_size);
            // decimal division can round the quotient up in the last digit
            while quantity > Decimal::ZERO && quantity * unit_cost > self.cash {
                quantity -= self.lot_size;
            }
            quantity = quantity.max(Decimal::ZERO);
        }

        if quantity.is_zero() {
            debug!(price = %price, cash = %self.cash, "Buy clipped to zero");
            return Ok(Fill::empty(OrderSide::Buy, price));
        }

        let notional = quantity * price;
        let fee = notional * self.commission_rate;
        let cash_delta = -(notional + fee);

        self.avg_entry_price = match self.avg_entry_price {
            Some(avg) if self.position > Decimal::ZERO => {
                Some((avg * self.position + notional) / (self.position + quantity))
            }
            _ => Some(price),
        };
        self.cash += cash_delta;
        self.position += quantity;
        self.fees_paid += fee;

        debug!(
            quantity = %quantity,
            price = %price,
            fee = %fee,
            cash = %self.cash,
            position = %self.position,
            "Paper buy filled"
        );

        Ok(Fill {
            side: OrderSide::Buy,
            quantity,
            price,
            notional,
            fee,
            cash_delta,
        })
    }

    /// Sell up to `quantity` at `price`, clipped to the open position.
    pub fn market_sell(&mut self, quantity: Decimal, price: Decimal) -> Result<Fill, ExchangeError> {
        ensure_price(price)?;
        self.order_count += 1;

        let quantity = quantity.max(Decimal::ZERO).min(self.position);
        if quantity.is_zero() {
            return Ok(Fill::empty(OrderSide::Sell, price));
        }

        let notional = quantity * price;
        let fee = notional * self.commission_rate;
        let cash_delta = notional - fee;

        self.cash += cash_delta;
        self.position -= quantity;
        self.fees_paid += fee;
        if self.position.is_zero() {
            self.avg_entry_price = None;
        }

        debug!(
            quantity = %quantity,
            price = %price,
            fee = %fee,
            cash = %self.cash,
            position = %self.position,
            "Paper sell filled"
        );

        Ok(Fill {
            side: OrderSide::Sell,
            quantity,
            price,
            notional,
            fee,
            cash_delta,
        })
    }
}

fn ensure_price(price: Decimal) -> Result<(), ExchangeError> {
    if price <= Decimal::ZERO {
        return Err(ExchangeError::InvalidPrice(price));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::decimal::weighted_average;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn create_test_exchange() -> PaperExchange {
        PaperExchange::new(dec!(10000)).unwrap()
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[test]
    fn test_buy_sets_position_and_average() {
        let mut ex = create_test_exchange();
        let fill = ex.market_buy(dec!(10), dec!(100)).unwrap();

        assert_eq!(fill.quantity, dec!(10));
        assert_eq!(fill.cash_delta, dec!(-1000));
        assert_eq!(ex.cash(), dec!(9000));
        assert_eq!(ex.position(), dec!(10));
        assert_eq!(ex.avg_entry_price(), Some(dec!(100)));
    }

    #[test]
    fn test_zero_price_is_rejected() {
        let mut ex = create_test_exchange();
        ex.market_buy(dec!(10), dec!(100)).unwrap();

        let err = ex.market_buy(dec!(10), Decimal::ZERO).unwrap_err();
        assert_eq!(err, ExchangeError::InvalidPrice(Decimal::ZERO));
        // state untouched
        assert_eq!(ex.cash(), dec!(9000));
        assert_eq!(ex.position(), dec!(10));

        assert!(ex.market_sell(dec!(1), dec!(-5)).is_err());
    }

    #[test]
    fn test_buy_clipped_to_affordable_whole_units() {
        let mut ex = PaperExchange::new(dec!(1050)).unwrap();
        let fill = ex.market_buy(dec!(50), dec!(100)).unwrap();

        assert_eq!(fill.quantity, dec!(10));
        assert_eq!(ex.cash(), dec!(50));
    }

    #[test]
    fn test_unaffordable_buy_is_zero_fill() {
        let mut ex = PaperExchange::new(dec!(50)).unwrap();
        let fill = ex.market_buy(dec!(1), dec!(100)).unwrap();

        assert!(fill.is_empty());
        assert_eq!(fill.cash_delta, Decimal::ZERO);
        assert_eq!(ex.cash(), dec!(50));
        assert!(ex.is_flat());
        assert_eq!(ex.avg_entry_price(), None);
        assert_eq!(ex.order_count(), 1);
    }

    #[test]
    fn test_negative_quantity_is_noop() {
        let mut ex = create_test_exchange();
        assert!(ex.market_buy(dec!(-3), dec!(100)).unwrap().is_empty());
        assert!(ex.market_sell(dec!(-3), dec!(100)).unwrap().is_empty());
        assert_eq!(ex.cash(), dec!(10000));
    }

    #[test]
    fn test_weighted_average_on_add() {
        let mut ex = create_test_exchange();
        ex.market_buy(dec!(10), dec!(100)).unwrap();
        ex.market_buy(dec!(10), dec!(110)).unwrap();

        assert_eq!(ex.avg_entry_price(), Some(dec!(105)));
        assert_eq!(ex.position(), dec!(20));
    }

    #[test]
    fn test_sell_clipped_to_position_and_clears_average() {
        let mut ex = create_test_exchange();
        ex.market_buy(dec!(10), dec!(100)).unwrap();

        let fill = ex.market_sell(dec!(25), dec!(120)).unwrap();
        assert_eq!(fill.quantity, dec!(10));
        assert_eq!(fill.cash_delta, dec!(1200));
        assert_eq!(ex.cash(), dec!(10200));
        assert!(ex.is_flat());
        assert_eq!(ex.avg_entry_price(), None);
    }

    #[test]
    fn test_partial_sell_keeps_average() {
        let mut ex = create_test_exchange();
        ex.market_buy(dec!(10), dec!(100)).unwrap();
        ex.market_sell(dec!(4), dec!(90)).unwrap();

        assert_eq!(ex.position(), dec!(6));
        assert_eq!(ex.avg_entry_price(), Some(dec!(100)));
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut ex = create_test_exchange();
        assert_eq!(ex.unrealized_pnl(dec!(50)), Decimal::ZERO);

        ex.market_buy(dec!(10), dec!(100)).unwrap();
        assert_eq!(ex.unrealized_pnl(dec!(94)), dec!(-60));
        assert_eq!(ex.equity(dec!(94)), dec!(9940));
    }

    #[test]
    fn test_commission_charged_both_sides() {
        let mut ex = create_test_exchange().with_commission(dec!(0.001)).unwrap();
        ex.market_buy(dec!(10), dec!(100)).unwrap();
        assert_eq!(ex.cash(), dec!(8999));

        ex.market_sell(dec!(10), dec!(100)).unwrap();
        assert_eq!(ex.cash(), dec!(9998));
        assert_eq!(ex.fees_paid(), dec!(2));
    }

    #[test]
    fn test_clip_accounts_for_commission() {
        let mut ex = PaperExchange::new(dec!(1000))
            .unwrap()
            .with_commission(dec!(0.01))
            .unwrap()
            .with_lot_size(dec!(0.1))
            .unwrap();
        let fill = ex.market_buy(dec!(100), dec!(100)).unwrap();

        // 1000 / 101 = 9.90..., rounded down to 9.9
        assert_eq!(fill.quantity, dec!(9.9));
        assert!(ex.cash() >= Decimal::ZERO);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(PaperExchange::new(dec!(-1)).is_err());
        assert!(create_test_exchange().with_commission(dec!(1)).is_err());
        assert!(create_test_exchange().with_lot_size(Decimal::ZERO).is_err());
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    fn order() -> impl Strategy<Value = (bool, i64, i64)> {
        (any::<bool>(), -50i64..5_000, 1i64..50_000)
    }

    proptest! {
        #[test]
        fn prop_cash_and_position_never_negative(
            orders in proptest::collection::vec(order(), 1..60),
            commission_bps in 0i64..100,
        ) {
            let mut ex = PaperExchange::new(dec!(10000))
                .unwrap()
                .with_commission(Decimal::new(commission_bps, 4))
                .unwrap()
                .with_lot_size(dec!(0.001))
                .unwrap();

            for (is_buy, qty_milli, price_cents) in orders {
                let qty = Decimal::new(qty_milli, 3);
                let price = Decimal::new(price_cents, 2);
                if is_buy {
                    ex.market_buy(qty, price).unwrap();
                } else {
                    ex.market_sell(qty, price).unwrap();
                }
                prop_assert!(ex.cash() >= Decimal::ZERO);
                prop_assert!(ex.position() >= Decimal::ZERO);
                prop_assert_eq!(ex.avg_entry_price().is_none(), ex.position().is_zero());
            }
        }

        #[test]
        fn prop_average_is_quantity_weighted_mean(
            buys in proptest::collection::vec((1i64..1_000, 1i64..100_000), 1..20),
        ) {
            let mut ex = PaperExchange::new(dec!(1_000_000_000_000)).unwrap();
            let mut fills = Vec::new();

            for (qty, price_cents) in buys {
                let fill = ex.market_buy(Decimal::from(qty), Decimal::new(price_cents, 2)).unwrap();
                fills.push((fill.price, fill.quantity));
            }

            let expected = weighted_average(&fills);
            let actual = ex.avg_entry_price().unwrap();
            prop_assert!((actual - expected).abs() < dec!(0.0000001));
        }
    }
}
