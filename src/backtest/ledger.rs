//! Trade ledger and equity curve records.

use crate::exchange::Fill;
use crate::strategy::Signal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeKind {
    Buy,
    Sell,
    StopLoss,
    TakeProfit,
    /// Forced liquidation at the end of the data.
    Final,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "BUY",
            TradeKind::Sell => "SELL",
            TradeKind::StopLoss => "STOP_LOSS",
            TradeKind::TakeProfit => "TAKE_PROFIT",
            TradeKind::Final => "FINAL",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, TradeKind::Buy)
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeKind::Buy),
            "SELL" => Ok(TradeKind::Sell),
            "STOP_LOSS" => Ok(TradeKind::StopLoss),
            "TAKE_PROFIT" => Ok(TradeKind::TakeProfit),
            "FINAL" => Ok(TradeKind::Final),
            other => anyhow::bail!("unknown trade type '{}'", other),
        }
    }
}

/// Gross P&L of an exit against its own entry price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub amount: Decimal,
    /// Fraction of the entry price (0.05 = +5%)
    pub pct: f64,
}

/// One exchange operation issued by the engine. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub kind: TradeKind,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    /// Signed change in cash caused by this trade
    pub cash_delta: Decimal,
    /// Entry classification of the position this trade belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<RealizedPnl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TradeEvent {
    /// BUY record carrying the triggering signal.
    pub fn entry(timestamp: DateTime<Utc>, fill: &Fill, tag: &str, signal: &Signal) -> Self {
        Self {
            kind: TradeKind::Buy,
            timestamp,
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            cash_delta: fill.cash_delta,
            tag: Some(tag.to_string()),
            pnl: None,
            confidence: Some(signal.confidence),
            reason: signal.reason.clone(),
        }
    }

    /// Exit record with P&L measured against `entry_price`.
    pub fn exit(
        kind: TradeKind,
        timestamp: DateTime<Utc>,
        fill: &Fill,
        tag: &str,
        entry_price: Decimal,
    ) -> Self {
        let amount = (fill.price - entry_price) * fill.quantity;
        let pct = crate::risk::RiskManager::pnl_pct(entry_price, fill.price);
        Self {
            kind,
            timestamp,
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            cash_delta: fill.cash_delta,
            tag: Some(tag.to_string()),
            pnl: Some(RealizedPnl { amount, pct }),
            confidence: None,
            reason: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Mark-to-market account value after a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    pub position: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderSide;
    use rust_decimal_macros::dec;

    fn create_test_fill(side: OrderSide, quantity: Decimal, price: Decimal) -> Fill {
        let notional = quantity * price;
        Fill {
            side,
            quantity,
            price,
            notional,
            fee: Decimal::ZERO,
            cash_delta: match side {
                OrderSide::Buy => -notional,
                OrderSide::Sell => notional,
            },
        }
    }

    #[test]
    fn test_exit_pnl() {
        let fill = create_test_fill(OrderSide::Sell, dec!(10), dec!(94));
        let event = TradeEvent::exit(TradeKind::StopLoss, Utc::now(), &fill, "default", dec!(100));
        let pnl = event.pnl.unwrap();
        assert_eq!(pnl.amount, dec!(-60));
        assert!((pnl.pct + 0.06).abs() < 1e-12);
        assert_eq!(event.cash_delta, dec!(940));
    }

    #[test]
    fn test_serialized_type_tag() {
        let fill = create_test_fill(OrderSide::Buy, dec!(1), dec!(100));
        let event = TradeEvent::entry(Utc::now(), &fill, "S3", &Signal::buy(0.9).with_reason("test"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "BUY");
        assert_eq!(json["tag"], "S3");
        assert!(json.get("pnl").is_none());

        let back: TradeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("TAKE_PROFIT".parse::<TradeKind>().unwrap(), TradeKind::TakeProfit);
        assert!("HODL".parse::<TradeKind>().is_err());
    }
}
