//! Performance metrics calculation for backtesting.
//!
//! Returns, drawdown and Sharpe come from the equity curve; win rate, profit
//! factor and average win/loss come from FIFO-paired ledger lots.

use super::ledger::{EquityPoint, TradeEvent};
use crate::market::Interval;
use crate::utils::decimal::{safe_div, to_f64};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Summary statistics of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Returns
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    /// (final − initial) / initial
    pub total_return: f64,
    /// Compounded to 365 days; 0 when no time elapsed
    pub annual_return: f64,
    pub elapsed_days: f64,

    // Risk
    /// Worst peak-to-trough decline, in [−1, 0]
    pub max_drawdown: f64,
    /// Bar returns annualized with the interval's bars per year
    pub sharpe_ratio: f64,
    pub calmar_ratio: f64,

    // Closed lots
    pub win_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    /// Gross wins / gross losses; +inf with wins and no losses
    pub profit_factor: f64,
    pub realized_pnl: Decimal,

    // Activity
    pub total_trades: usize,
    pub closed_lots: usize,
    pub winning_lots: usize,
    pub losing_lots: usize,
    pub fees_paid: Decimal,
}

impl PerformanceMetrics {
    pub fn calculate(
        initial_capital: Decimal,
        equity_curve: &[EquityPoint],
        trades: &[TradeEvent],
        interval: Interval,
    ) -> Self {
        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);

        let total_return = to_f64(safe_div(final_equity - initial_capital, initial_capital));

        let elapsed_days = elapsed_bars(equity_curve) as f64 / interval.bars_per_day();
        let annual_return = annualize(initial_capital, final_equity, elapsed_days);

        let max_drawdown = max_drawdown(equity_curve);
        let sharpe_ratio = sharpe(&bar_returns(equity_curve), interval.bars_per_year());
        let calmar_ratio = if max_drawdown < 0.0 {
            annual_return / max_drawdown.abs()
        } else {
            0.0
        };

        let lots = pair_lots_fifo(trades);
        let wins: Vec<Decimal> = lots.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = lots.iter().copied().filter(|p| *p < Decimal::ZERO).collect();
        let gross_win: Decimal = wins.iter().sum();
        let gross_loss: Decimal = losses.iter().sum::<Decimal>().abs();

        let win_rate = if lots.is_empty() {
            0.0
        } else {
            wins.len() as f64 / lots.len() as f64
        };
        let profit_factor = if gross_loss > Decimal::ZERO {
            to_f64(gross_win / gross_loss)
        } else if gross_win > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            initial_capital,
            final_equity,
            total_return,
            annual_return,
            elapsed_days,
            max_drawdown,
            sharpe_ratio,
            calmar_ratio,
            win_rate,
            avg_win: average(&wins),
            avg_loss: average(&losses),
            profit_factor,
            realized_pnl: lots.iter().sum(),
            total_trades: trades.len(),
            closed_lots: lots.len(),
            winning_lots: wins.len(),
            losing_lots: losses.len(),
            fees_paid: trades.iter().map(|t| t.fee).sum(),
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Initial Capital:   ${:.2}
  Final Equity:      ${:.2}
  Total Return:      {:.2}%
  Annualized:        {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Sharpe Ratio:      {:.3}
  Calmar Ratio:      {:.3}

TRADES
  Ledger Entries:    {}
  Closed Lots:       {} ({} won, {} lost)
  Win Rate:          {:.1}%
  Avg Win:           ${:.2}
  Avg Loss:          ${:.2}
  Profit Factor:     {:.2}
  Realized P&L:      ${:.2}
  Fees Paid:         ${:.2}
═══════════════════════════════════════════════"#,
            self.elapsed_days,
            self.initial_capital,
            self.final_equity,
            self.total_return * 100.0,
            self.annual_return * 100.0,
            self.max_drawdown * 100.0,
            self.sharpe_ratio,
            self.calmar_ratio,
            self.total_trades,
            self.closed_lots,
            self.winning_lots,
            self.losing_lots,
            self.win_rate * 100.0,
            self.avg_win,
            self.avg_loss,
            self.profit_factor,
            self.realized_pnl,
            self.fees_paid,
        )
    }
}

/// Bars between the first and last sample. Samples sharing a timestamp
/// (the post-liquidation sample) do not add time.
fn elapsed_bars(equity_curve: &[EquityPoint]) -> usize {
    equity_curve
        .windows(2)
        .filter(|w| w[1].timestamp > w[0].timestamp)
        .count()
}

fn annualize(initial: Decimal, final_equity: Decimal, elapsed_days: f64) -> f64 {
    if elapsed_days <= 0.0 || initial <= Decimal::ZERO {
        return 0.0;
    }
    let growth = to_f64(final_equity / initial);
    if growth <= 0.0 {
        return -1.0;
    }
    growth.powf(365.0 / elapsed_days) - 1.0
}

fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = Decimal::MIN;
    let mut worst = 0.0_f64;
    for point in equity_curve {
        peak = peak.max(point.equity);
        if peak > Decimal::ZERO {
            let dd = to_f64((point.equity - peak) / peak);
            worst = worst.min(dd);
        }
    }
    worst.max(-1.0)
}

fn bar_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| to_f64(safe_div(w[1].equity - w[0].equity, w[0].equity)))
        .collect()
}

fn sharpe(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev < 1e-12 {
        return 0.0;
    }
    mean / std_dev * periods_per_year.sqrt()
}

/// Realized P&L of every (entry lot, exit) piece, oldest lots consumed first.
fn pair_lots_fifo(trades: &[TradeEvent]) -> Vec<Decimal> {
    let mut open: VecDeque<(Decimal, Decimal)> = VecDeque::new();
    let mut closed = Vec::new();

    for trade in trades {
        if trade.quantity <= Decimal::ZERO {
            continue;
        }
        if trade.kind.is_entry() {
            open.push_back((trade.quantity, trade.price));
            continue;
        }

        let mut remaining = trade.quantity;
        while remaining > Decimal::ZERO {
            let Some((lot_qty, lot_price)) = open.front_mut() else {
                break;
            };
            let piece = remaining.min(*lot_qty);
            closed.push((trade.price - *lot_price) * piece);
            *lot_qty -= piece;
            remaining -= piece;
            if lot_qty.is_zero() {
                open.pop_front();
            }
        }
    }
    closed
}

fn average(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}
