//! SQLite persistence for market data and backtest history.
//!
//! Stores:
//! - Downloaded candles, keyed by symbol, interval and open time
//! - Completed backtest runs with their headline metrics
//! - Per-run trade ledger and equity curve

use crate::backtest::{BacktestResult, EquityPoint, RealizedPnl, TradeEvent, TradeKind};
use crate::market::{Candle, Interval};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Headline numbers of a stored run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub symbol: String,
    pub strategy: String,
    pub interval: String,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub total_trades: usize,
    /// Risk parameters as JSON
    pub risk: String,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Candle cache
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, interval, timestamp)
            );

            -- Backtest runs
            CREATE TABLE IF NOT EXISTS backtest_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                interval TEXT NOT NULL,
                initial_capital TEXT NOT NULL,
                final_equity TEXT NOT NULL,
                total_return REAL NOT NULL,
                sharpe_ratio REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                risk TEXT NOT NULL
            );

            -- Trade ledger per run
            CREATE TABLE IF NOT EXISTS run_trades (
                run_id INTEGER NOT NULL REFERENCES backtest_runs(id),
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                cash_delta TEXT NOT NULL,
                tag TEXT,
                pnl TEXT,
                pnl_pct REAL,
                confidence REAL,
                reason TEXT,
                PRIMARY KEY (run_id, seq)
            );

            -- Equity curve per run
            CREATE TABLE IF NOT EXISTS run_equity (
                run_id INTEGER NOT NULL REFERENCES backtest_runs(id),
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                equity TEXT NOT NULL,
                cash TEXT NOT NULL,
                position TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Insert or replace candles. Returns the number of rows written.
    pub fn upsert_candles(&self, symbol: &str, interval: Interval, candles: &[Candle]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO candles (symbol, interval, timestamp, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol, interval, timestamp) DO UPDATE SET
                    open = ?4, high = ?5, low = ?6, close = ?7, volume = ?8
                "#,
            )?;
            for candle in candles {
                stmt.execute(params![
                    symbol,
                    interval.as_str(),
                    candle.timestamp.to_rfc3339(),
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume.to_string(),
                ])?;
            }
        }
        tx.commit()?;

        debug!(symbol, interval = %interval, count = candles.len(), "Candles cached");
        Ok(candles.len())
    }

    /// Most recent `limit` candles in ascending time order.
    pub fn load_candles(&self, symbol: &str, interval: Interval, limit: usize) -> Result<Vec<Candle>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, open, high, low, close, volume
            FROM candles
            WHERE symbol = ?1 AND interval = ?2
            ORDER BY timestamp DESC
            LIMIT ?3
            "#,
        )?;

        let mut candles = stmt
            .query_map(params![symbol, interval.as_str(), limit as i64], |row| {
                Ok(Candle {
                    timestamp: timestamp_column(row, 0)?,
                    open: decimal_column(row, 1)?,
                    high: decimal_column(row, 2)?,
                    low: decimal_column(row, 3)?,
                    close: decimal_column(row, 4)?,
                    volume: decimal_column(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read cached candles")?;

        candles.reverse();
        Ok(candles)
    }

    /// Store a completed run with its ledger and equity curve.
    pub fn save_run(&self, symbol: &str, result: &BacktestResult) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO backtest_runs (created_at, symbol, strategy, interval, initial_capital,
                                       final_equity, total_return, sharpe_ratio, max_drawdown,
                                       total_trades, risk)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                Utc::now().to_rfc3339(),
                symbol,
                result.strategy,
                result.interval.as_str(),
                result.initial_capital.to_string(),
                result.final_equity().to_string(),
                result.metrics.total_return,
                result.metrics.sharpe_ratio,
                result.metrics.max_drawdown,
                result.trades.len() as i64,
                serde_json::to_string(&result.risk)?,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO run_trades (run_id, seq, kind, timestamp, price, quantity, fee,
                                        cash_delta, tag, pnl, pnl_pct, confidence, reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )?;
            for (seq, trade) in result.trades.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    seq as i64,
                    trade.kind.as_str(),
                    trade.timestamp.to_rfc3339(),
                    trade.price.to_string(),
                    trade.quantity.to_string(),
                    trade.fee.to_string(),
                    trade.cash_delta.to_string(),
                    trade.tag,
                    trade.pnl.map(|p| p.amount.to_string()),
                    trade.pnl.map(|p| p.pct),
                    trade.confidence,
                    trade.reason,
                ])?;
            }

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO run_equity (run_id, seq, timestamp, equity, cash, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for (seq, point) in result.equity_curve.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    seq as i64,
                    point.timestamp.to_rfc3339(),
                    point.equity.to_string(),
                    point.cash.to_string(),
                    point.position.to_string(),
                ])?;
            }
        }

        tx.commit()?;

        info!(
            run_id,
            strategy = %result.strategy,
            trades = result.trades.len(),
            "Backtest run saved"
        );
        Ok(run_id)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, created_at, symbol, strategy, interval, initial_capital, final_equity,
                   total_return, sharpe_ratio, max_drawdown, total_trades, risk
            FROM backtest_runs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let runs = stmt
            .query_map([limit as i64], |row| {
                Ok(RunSummary {
                    id: row.get(0)?,
                    created_at: timestamp_column(row, 1)?,
                    symbol: row.get(2)?,
                    strategy: row.get(3)?,
                    interval: row.get(4)?,
                    initial_capital: decimal_column(row, 5)?,
                    final_equity: decimal_column(row, 6)?,
                    total_return: row.get(7)?,
                    sharpe_ratio: row.get(8)?,
                    max_drawdown: row.get(9)?,
                    total_trades: row.get::<_, i64>(10)? as usize,
                    risk: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(runs)
    }

    /// Equity curve of a stored run, in recorded order.
    pub fn load_equity(&self, run_id: i64) -> Result<Vec<EquityPoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, equity, cash, position
            FROM run_equity
            WHERE run_id = ?1
            ORDER BY seq
            "#,
        )?;

        let points = stmt
            .query_map([run_id], |row| {
                Ok(EquityPoint {
                    timestamp: timestamp_column(row, 0)?,
                    equity: decimal_column(row, 1)?,
                    cash: decimal_column(row, 2)?,
                    position: decimal_column(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(points)
    }

    /// Trade ledger of a stored run, in recorded order.
    pub fn load_trades(&self, run_id: i64) -> Result<Vec<TradeEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT kind, timestamp, price, quantity, fee, cash_delta, tag, pnl, pnl_pct,
                   confidence, reason
            FROM run_trades
            WHERE run_id = ?1
            ORDER BY seq
            "#,
        )?;

        let trades = stmt
            .query_map([run_id], |row| {
                let kind: String = row.get(0)?;
                let kind = TradeKind::from_str(&kind).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
                })?;
                let pnl = match row.get::<_, Option<String>>(7)? {
                    Some(_) => Some(RealizedPnl {
                        amount: decimal_column(row, 7)?,
                        pct: row.get::<_, Option<f64>>(8)?.unwrap_or_default(),
                    }),
                    None => None,
                };

                Ok(TradeEvent {
                    kind,
                    timestamp: timestamp_column(row, 1)?,
                    price: decimal_column(row, 2)?,
                    quantity: decimal_column(row, 3)?,
                    fee: decimal_column(row, 4)?,
                    cash_delta: decimal_column(row, 5)?,
                    tag: row.get(6)?,
                    pnl,
                    confidence: row.get(9)?,
                    reason: row.get(10)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(trades)
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
