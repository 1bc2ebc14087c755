//! Backtesting simulation engine.
//!
//! Walks a candle series bar by bar: risk exits first, then the signal for
//! the history prefix ending at the bar, then one equity sample. Open
//! positions are liquidated at the last close when the data runs out.

use super::ledger::{EquityPoint, TradeEvent, TradeKind};
use super::metrics::PerformanceMetrics;
use super::{EngineConfig, PositionMode};
use crate::config::RiskConfig;
use crate::exchange::{ExchangeError, PaperExchange};
use crate::market::{Candle, Interval};
use crate::risk::{ExitLevels, ExitReason, RiskManager, TrendFilter};
use crate::strategy::{ExitTarget, Side, Signal, SignalError, SignalProvider};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tag for entries whose signal carries no entry plan.
pub const DEFAULT_TAG: &str = "default";

/// Configuration problems detected before a run starts.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("invalid risk configuration: {0}")]
    InvalidRisk(String),
    #[error("max open positions must be at least 1")]
    NoPositionSlots,
}

/// Why a single bar was skipped. The run continues.
#[derive(Debug, Error)]
pub enum BarFault {
    #[error("signal provider failed: {0}")]
    Signal(#[from] SignalError),
    #[error("bar close {0} is not a valid price")]
    InvalidPrice(Decimal),
    #[error("order rejected: {0}")]
    Exchange(#[from] ExchangeError),
}

/// What happened on a processed bar.
#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    Hold,
    Entered { tag: String, quantity: Decimal },
    /// Buy signal rejected by the trend filter or sizing.
    EntrySkipped,
    RiskExit { exits: usize },
    SignalExit { exits: usize },
}

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub initial_capital: Decimal,
    pub commission_rate: Decimal,
    pub interval: Interval,
    pub risk: RiskConfig,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<TradeEvent>,
    pub equity_curve: Vec<EquityPoint>,
    pub bars_processed: usize,
    pub faulted_bars: usize,
    /// Exchange operations issued; always equal to `trades.len()`
    pub orders_issued: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BacktestResult {
    /// Zero-trade result for series too short to evaluate.
    pub fn empty(engine: &BacktestEngine, candles: &[Candle]) -> Self {
        let initial = engine.config.initial_capital;
        let equity_curve = vec![EquityPoint {
            timestamp: candles.last().map(|c| c.timestamp).unwrap_or_default(),
            equity: initial,
            cash: initial,
            position: Decimal::ZERO,
        }];
        let metrics =
            PerformanceMetrics::calculate(initial, &equity_curve, &[], engine.config.interval);

        Self {
            strategy: engine.provider.name().to_string(),
            initial_capital: initial,
            commission_rate: engine.config.commission_rate,
            interval: engine.config.interval,
            risk: engine.risk.config().clone(),
            metrics,
            trades: Vec::new(),
            equity_curve,
            bars_processed: 0,
            faulted_bars: 0,
            orders_issued: 0,
            start_time: candles.first().map(|c| c.timestamp),
            end_time: candles.last().map(|c| c.timestamp),
        }
    }

    pub fn final_equity(&self) -> Decimal {
        self.metrics.final_equity
    }

    /// Export equity curve to CSV.
    pub fn equity_to_csv(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "timestamp,equity,cash,position")?;

        for point in &self.equity_curve {
            writeln!(
                file,
                "{},{},{},{}",
                point.timestamp.to_rfc3339(),
                point.equity,
                point.cash,
                point.position,
            )?;
        }

        Ok(())
    }

    /// Export the trade ledger to CSV.
    pub fn trades_to_csv(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(
            file,
            "timestamp,type,tag,price,quantity,fee,cash_delta,pnl,pnl_pct,confidence,reason"
        )?;

        for trade in &self.trades {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{},{}",
                trade.timestamp.to_rfc3339(),
                trade.kind,
                trade.tag.as_deref().unwrap_or(""),
                trade.price,
                trade.quantity,
                trade.fee,
                trade.cash_delta,
                trade.pnl.map(|p| p.amount.to_string()).unwrap_or_default(),
                trade.pnl.map(|p| format!("{:.6}", p.pct)).unwrap_or_default(),
                trade.confidence.map(|c| format!("{:.4}", c)).unwrap_or_default(),
                csv_quote(trade.reason.as_deref().unwrap_or("")),
            )?;
        }

        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let period = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => format!(
                "{} to {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M")
            ),
            _ => "no data".to_string(),
        };
        format!(
            "{}\n\nStrategy: {} ({})\nBacktest Period: {}\nBars Processed: {}\nSkipped Bars: {}",
            self.metrics.summary(),
            self.strategy,
            self.interval,
            period,
            self.bars_processed,
            self.faulted_bars,
        )
    }
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// The backtesting simulation engine.
///
/// Holds only immutable run parameters; every call to [`run`](Self::run)
/// owns a fresh exchange, ledger and equity curve.
pub struct BacktestEngine {
    config: EngineConfig,
    risk: RiskManager,
    provider: Arc<dyn SignalProvider>,
    exchange: PaperExchange,
}

impl BacktestEngine {
    /// Validate parameters and build an engine.
    pub fn new(
        config: EngineConfig,
        risk_config: RiskConfig,
        provider: Arc<dyn SignalProvider>,
    ) -> Result<Self, BacktestError> {
        risk_config
            .validate()
            .map_err(|e| BacktestError::InvalidRisk(e.to_string()))?;
        if let PositionMode::Multi { max_open: 0 } = config.position_mode {
            return Err(BacktestError::NoPositionSlots);
        }

        let exchange = PaperExchange::new(config.initial_capital)?
            .with_commission(config.commission_rate)?
            .with_lot_size(risk_config.quantity_step)?;

        Ok(Self {
            config,
            risk: RiskManager::new(risk_config),
            provider,
            exchange,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bars consumed before the first decision.
    pub fn warmup(&self) -> usize {
        let lookback = self.provider.min_lookback();
        if self.risk.config().use_trend_filter {
            lookback.max(self.risk.config().trend_slow)
        } else {
            lookback
        }
    }

    /// Run the backtest over `candles` (ascending, validated).
    pub fn run(&self, candles: &[Candle]) -> BacktestResult {
        let warmup = self.warmup();
        if candles.len() <= warmup {
            info!(
                strategy = self.provider.name(),
                bars = candles.len(),
                warmup,
                "Not enough data to backtest"
            );
            return BacktestResult::empty(self, candles);
        }

        info!(
            strategy = self.provider.name(),
            bars = candles.len(),
            warmup,
            capital = %self.config.initial_capital,
            "Starting backtest"
        );

        let mut sim = Simulation::new(self, candles, warmup);
        let mut faulted_bars = 0;

        for i in warmup..candles.len() {
            match sim.step(i) {
                Ok(BarOutcome::Hold) => {}
                Ok(outcome) => debug!(bar = i, ?outcome, "Bar processed"),
                Err(fault) => {
                    faulted_bars += 1;
                    warn!(
                        bar = i,
                        timestamp = %candles[i].timestamp,
                        error = %fault,
                        "Skipping bar"
                    );
                }
            }
            sim.record_equity(i);

            if (i - warmup) % 1000 == 0 {
                debug!(
                    "Progress: {}/{} ({:.1}%), Equity: ${:.2}",
                    i,
                    candles.len(),
                    (i as f64 / candles.len() as f64) * 100.0,
                    sim.exchange.equity(candles[i].close)
                );
            }
        }

        sim.liquidate();

        let metrics = PerformanceMetrics::calculate(
            self.config.initial_capital,
            &sim.equity_curve,
            &sim.trades,
            self.config.interval,
        );

        info!(
            final_equity = %metrics.final_equity,
            trades = sim.trades.len(),
            faulted_bars,
            "Backtest complete"
        );

        BacktestResult {
            strategy: self.provider.name().to_string(),
            initial_capital: self.config.initial_capital,
            commission_rate: self.config.commission_rate,
            interval: self.config.interval,
            risk: self.risk.config().clone(),
            metrics,
            orders_issued: sim.exchange.order_count(),
            trades: sim.trades,
            equity_curve: sim.equity_curve,
            bars_processed: candles.len() - warmup,
            faulted_bars,
            start_time: candles.first().map(|c| c.timestamp),
            end_time: candles.last().map(|c| c.timestamp),
        }
    }
}

/// Convenience wrapper: default interval and position mode.
pub fn run_backtest(
    candles: &[Candle],
    initial_capital: Decimal,
    commission_rate: Decimal,
    risk_config: RiskConfig,
    provider: Arc<dyn SignalProvider>,
) -> Result<BacktestResult, BacktestError> {
    let config = EngineConfig {
        initial_capital,
        commission_rate,
        ..EngineConfig::default()
    };
    Ok(BacktestEngine::new(config, risk_config, provider)?.run(candles))
}

/// One open entry. In single-position mode there is at most one.
#[derive(Debug, Clone)]
struct SubPosition {
    tag: String,
    quantity: Decimal,
    original_quantity: Decimal,
    entry_price: Decimal,
    levels: ExitLevels,
    targets: Vec<ExitTarget>,
    next_target: usize,
}

#[derive(Debug)]
struct PlannedExit {
    position: usize,
    kind: TradeKind,
    quantity: Decimal,
    /// Target index reached, for ladder exits
    target: Option<usize>,
}

/// Mutable state of one run.
struct Simulation<'a> {
    engine: &'a BacktestEngine,
    candles: &'a [Candle],
    exchange: PaperExchange,
    positions: Vec<SubPosition>,
    trades: Vec<TradeEvent>,
    equity_curve: Vec<EquityPoint>,
    trend: Option<TrendFilter>,
}

impl<'a> Simulation<'a> {
    fn new(engine: &'a BacktestEngine, candles: &'a [Candle], warmup: usize) -> Self {
        let risk = engine.risk.config();
        let trend = risk
            .use_trend_filter
            .then(|| TrendFilter::new(candles, risk.trend_fast, risk.trend_slow));

        let initial = engine.config.initial_capital;
        let equity_curve = vec![EquityPoint {
            timestamp: candles[warmup].timestamp - engine.config.interval.duration(),
            equity: initial,
            cash: initial,
            position: Decimal::ZERO,
        }];

        Self {
            engine,
            candles,
            exchange: engine.exchange.clone(),
            positions: Vec::new(),
            trades: Vec::new(),
            equity_curve,
            trend,
        }
    }

    fn step(&mut self, i: usize) -> Result<BarOutcome, BarFault> {
        let candles = self.candles;
        let bar = &candles[i];
        if bar.close <= Decimal::ZERO {
            return Err(BarFault::InvalidPrice(bar.close));
        }

        let exits = self.plan_risk_exits(bar.close);
        if !exits.is_empty() {
            let count = exits.len();
            self.execute_exits(bar, exits)?;
            return Ok(BarOutcome::RiskExit { exits: count });
        }

        let signal = self.engine.provider.evaluate(&candles[..=i])?;
        signal.validate()?;

        match signal.side {
            Side::Buy => self.try_enter(i, &signal),
            Side::Sell
                if !self.positions.is_empty() && self.engine.risk.passes_confidence(&signal) =>
            {
                self.exit_all(bar, &signal)
            }
            _ => Ok(BarOutcome::Hold),
        }
    }

    /// Stops fire before targets. Positions with an exit ladder take profit
    /// only through their targets.
    fn plan_risk_exits(&self, mark: Decimal) -> Vec<PlannedExit> {
        let mut planned = Vec::new();

        for (index, pos) in self.positions.iter().enumerate() {
            let full = |kind| PlannedExit {
                position: index,
                kind,
                quantity: pos.quantity,
                target: None,
            };
            match self.engine.risk.check_exit(&pos.levels, mark) {
                Some(ExitReason::StopLoss) => {
                    planned.push(full(TradeKind::StopLoss));
                    continue;
                }
                Some(ExitReason::TakeProfit) if pos.targets.is_empty() => {
                    planned.push(full(TradeKind::TakeProfit));
                    continue;
                }
                _ => {}
            }

            let mut remaining = pos.quantity;
            for (k, target) in pos.targets.iter().enumerate().skip(pos.next_target) {
                if mark < target.price || remaining <= Decimal::ZERO {
                    break;
                }
                let quantity = if k + 1 == pos.targets.len() {
                    remaining
                } else {
                    (target.fraction * pos.original_quantity).min(remaining)
                };
                remaining -= quantity;
                planned.push(PlannedExit {
                    position: index,
                    kind: TradeKind::TakeProfit,
                    quantity,
                    target: Some(k),
                });
            }
        }
        planned
    }

    fn execute_exits(&mut self, bar: &Candle, exits: Vec<PlannedExit>) -> Result<(), BarFault> {
        for exit in exits {
            let fill = self.exchange.market_sell(exit.quantity, bar.close)?;
            let pos = &mut self.positions[exit.position];

            let mut event =
                TradeEvent::exit(exit.kind, bar.timestamp, &fill, &pos.tag, pos.entry_price);
            if let Some(k) = exit.target {
                event = event.with_reason(pos.targets[k].label.clone());
                pos.next_target = k + 1;
            }
            info!(
                kind = %exit.kind,
                tag = %pos.tag,
                price = %fill.price,
                quantity = %fill.quantity,
                "Risk exit"
            );
            pos.quantity -= fill.quantity;
            self.trades.push(event);
        }
        self.positions.retain(|p| p.quantity > Decimal::ZERO);
        Ok(())
    }

    fn has_slot(&self, tag: &str) -> bool {
        match self.engine.config.position_mode {
            PositionMode::Single => self.positions.is_empty(),
            PositionMode::Multi { max_open } => {
                self.positions.len() < max_open && !self.positions.iter().any(|p| p.tag == tag)
            }
        }
    }

    fn try_enter(&mut self, i: usize, signal: &Signal) -> Result<BarOutcome, BarFault> {
        let risk = &self.engine.risk;
        let tag = signal
            .entry
            .as_ref()
            .map(|plan| plan.tag.as_str())
            .unwrap_or(DEFAULT_TAG);

        if !risk.passes_confidence(signal) || !self.has_slot(tag) {
            return Ok(BarOutcome::Hold);
        }
        if let Some(trend) = &self.trend {
            if !trend.allows(i) {
                debug!(bar = i, "Entry blocked by trend filter");
                return Ok(BarOutcome::EntrySkipped);
            }
        }

        let bar = &self.candles[i];
        let Some(quantity) = risk.entry_size(
            self.exchange.cash(),
            self.exchange.position(),
            bar.close,
            signal.confidence,
            self.exchange.commission_rate(),
        ) else {
            return Ok(BarOutcome::EntrySkipped);
        };
        let levels = risk.exit_levels(bar.close, &self.candles[..=i]);

        let fill = self.exchange.market_buy(quantity, bar.close)?;
        self.trades
            .push(TradeEvent::entry(bar.timestamp, &fill, tag, signal));
        if fill.is_empty() {
            return Ok(BarOutcome::EntrySkipped);
        }

        info!(
            tag,
            price = %fill.price,
            quantity = %fill.quantity,
            confidence = signal.confidence,
            stop = %levels.stop,
            target = %levels.target,
            "Entered position"
        );
        self.positions.push(SubPosition {
            tag: tag.to_string(),
            quantity: fill.quantity,
            original_quantity: fill.quantity,
            entry_price: fill.price,
            levels,
            targets: signal
                .entry
                .as_ref()
                .map(|plan| plan.targets.clone())
                .unwrap_or_default(),
            next_target: 0,
        });

        Ok(BarOutcome::Entered {
            tag: tag.to_string(),
            quantity: fill.quantity,
        })
    }

    /// A sell signal closes every open sub-position.
    fn exit_all(&mut self, bar: &Candle, signal: &Signal) -> Result<BarOutcome, BarFault> {
        let exits = self.positions.len();
        for pos in std::mem::take(&mut self.positions) {
            let fill = self.exchange.market_sell(pos.quantity, bar.close)?;
            let mut event =
                TradeEvent::exit(TradeKind::Sell, bar.timestamp, &fill, &pos.tag, pos.entry_price)
                    .with_confidence(signal.confidence);
            if let Some(reason) = &signal.reason {
                event = event.with_reason(reason.clone());
            }
            info!(
                tag = %pos.tag,
                price = %fill.price,
                quantity = %fill.quantity,
                "Signal exit"
            );
            self.trades.push(event);
        }
        Ok(BarOutcome::SignalExit { exits })
    }

    fn record_equity(&mut self, i: usize) {
        let bar = &self.candles[i];
        self.equity_curve.push(EquityPoint {
            timestamp: bar.timestamp,
            equity: self.exchange.equity(bar.close),
            cash: self.exchange.cash(),
            position: self.exchange.position(),
        });
    }

    /// Close whatever is still open at the last close, one FINAL record per
    /// sub-position, then restate equity as cash.
    fn liquidate(&mut self) {
        let Some(last) = self.candles.last() else {
            return;
        };
        if self.positions.is_empty() {
            return;
        }

        for pos in std::mem::take(&mut self.positions) {
            match self.exchange.market_sell(pos.quantity, last.close) {
                Ok(fill) => {
                    info!(tag = %pos.tag, price = %fill.price, quantity = %fill.quantity, "Final liquidation");
                    self.trades.push(TradeEvent::exit(
                        TradeKind::Final,
                        last.timestamp,
                        &fill,
                        &pos.tag,
                        pos.entry_price,
                    ));
                }
                Err(e) => warn!(tag = %pos.tag, error = %e, "Final liquidation failed"),
            }
        }
        self.record_equity(self.candles.len() - 1);
    }
}
