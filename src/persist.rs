use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use crate::config::BacktestConfig;
use crate::data::Region;
use crate::engine::metrics;
use crate::engine::types::{BacktestResult, EquityPoint, ExitReason, Trade};

/// SQLite-backed store for finished runs: a results header (deduplicated on
/// config hash + window), the full trade log, and the equity curve. Decimal
/// columns are stored as canonical strings so fixed-point values round-trip
/// exactly.
pub struct ResultStore {
    conn: Connection,
}

/// Header row, as listed by `compare`.
#[derive(Debug, Clone)]
pub struct ResultSummary {
    pub id: i64,
    pub strategy_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_return: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: i64,
    pub execution_time_ms: i64,
}

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening result store {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY,
                config_hash TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                regions TEXT NOT NULL,
                config_json TEXT NOT NULL,
                initial_capital TEXT NOT NULL,
                final_value TEXT NOT NULL,
                total_return REAL NOT NULL,
                cagr REAL NOT NULL,
                sharpe REAL NOT NULL,
                sortino REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                calmar REAL NOT NULL,
                win_rate REAL NOT NULL,
                profit_factor REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_results_dedup
                ON results (config_hash, start_date, end_date);

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY,
                result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
                ticker TEXT NOT NULL,
                region TEXT NOT NULL,
                entry_date TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                shares INTEGER NOT NULL,
                stop_loss_price TEXT NOT NULL,
                profit_target_price TEXT NOT NULL,
                pattern_tag TEXT NOT NULL,
                entry_score REAL NOT NULL,
                predicted_win_rate REAL,
                sector_tag TEXT NOT NULL,
                exit_date TEXT,
                exit_price TEXT,
                commission_paid TEXT NOT NULL,
                slippage_paid TEXT NOT NULL,
                realized_pnl TEXT,
                realized_return REAL,
                exit_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY,
                result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                cash TEXT NOT NULL,
                positions_value TEXT NOT NULL,
                total_value TEXT NOT NULL,
                daily_return REAL NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Persist a result. An existing run with the same config hash and
    /// window is replaced wholesale. Returns the header row id.
    pub fn save(&mut self, result: &BacktestResult) -> Result<i64> {
        let config_hash = result.config.content_hash();
        let config_json = serde_json::to_string(&result.config)?;
        let regions = result
            .config
            .regions
            .iter()
            .map(|r| r.code())
            .collect::<Vec<_>>()
            .join(",");

        let tx = self.conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM results
                 WHERE config_hash = ?1 AND start_date = ?2 AND end_date = ?3",
                params![
                    config_hash,
                    result.start_date.to_string(),
                    result.end_date.to_string()
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.execute("DELETE FROM results WHERE id = ?1", params![id])?;
        }

        tx.execute(
            "INSERT INTO results (
                config_hash, strategy_id, start_date, end_date, regions,
                config_json, initial_capital, final_value,
                total_return, cagr, sharpe, sortino, max_drawdown, calmar,
                win_rate, profit_factor, total_trades, execution_time_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                config_hash,
                result.config.strategy_id,
                result.start_date.to_string(),
                result.end_date.to_string(),
                regions,
                config_json,
                result.config.initial_capital.to_string(),
                result.final_value().to_string(),
                result.metrics.returns.total_return,
                result.metrics.returns.cagr,
                result.metrics.risk.sharpe,
                result.metrics.risk.sortino,
                result.metrics.risk.max_drawdown,
                result.metrics.risk.calmar,
                result.metrics.trading.win_rate,
                result.metrics.trading.profit_factor,
                result.trades.len() as i64,
                result.execution_time.as_millis() as i64,
            ],
        )?;
        let result_id = tx.last_insert_rowid();

        {
            let mut insert_trade = tx.prepare(
                "INSERT INTO trades (
                    result_id, ticker, region, entry_date, entry_price, shares,
                    stop_loss_price, profit_target_price, pattern_tag,
                    entry_score, predicted_win_rate, sector_tag,
                    exit_date, exit_price, commission_paid, slippage_paid,
                    realized_pnl, realized_return, exit_reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            )?;
            for trade in &result.trades {
                insert_trade.execute(params![
                    result_id,
                    trade.ticker,
                    trade.region.code(),
                    trade.entry_date.to_string(),
                    trade.entry_price.to_string(),
                    trade.shares as i64,
                    trade.stop_loss_price.to_string(),
                    trade.profit_target_price.to_string(),
                    trade.pattern_tag,
                    trade.entry_score,
                    trade.predicted_win_rate,
                    trade.sector_tag,
                    trade.exit_date.map(|d| d.to_string()),
                    trade.exit_price.map(|p| p.to_string()),
                    trade.commission_paid.to_string(),
                    trade.slippage_paid.to_string(),
                    trade.realized_pnl.map(|p| p.to_string()),
                    trade.realized_return,
                    trade.exit_reason.map(ExitReason::as_str),
                ])?;
            }

            let mut insert_point = tx.prepare(
                "INSERT INTO equity_curve (
                    result_id, date, cash, positions_value, total_value, daily_return
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for point in &result.equity_curve {
                insert_point.execute(params![
                    result_id,
                    point.date.to_string(),
                    point.cash.to_string(),
                    point.positions_value.to_string(),
                    point.total_value.to_string(),
                    point.daily_return,
                ])?;
            }
        }

        tx.commit()?;
        tracing::info!(result_id, %config_hash, "saved backtest result");
        Ok(result_id)
    }

    /// Reload a full result. Metrics are recomputed from the stored trades
    /// and curve, which reproduces them exactly because the computation is
    /// deterministic over identical inputs.
    pub fn load(&self, id: i64) -> Result<BacktestResult> {
        let (config_json, start_date, end_date, execution_time_ms): (String, String, String, i64) =
            self.conn
                .query_row(
                    "SELECT config_json, start_date, end_date, execution_time_ms
                     FROM results WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    },
                )
                .with_context(|| format!("no saved result with id {id}"))?;

        let config: BacktestConfig = serde_json::from_str(&config_json)?;
        let start_date = parse_date(&start_date)?;
        let end_date = parse_date(&end_date)?;

        let mut stmt = self.conn.prepare(
            "SELECT ticker, region, entry_date, entry_price, shares,
                    stop_loss_price, profit_target_price, pattern_tag,
                    entry_score, predicted_win_rate, sector_tag,
                    exit_date, exit_price, commission_paid, slippage_paid,
                    realized_pnl, realized_return, exit_reason
             FROM trades WHERE result_id = ?1 ORDER BY id",
        )?;
        let trades = stmt
            .query_map(params![id], trade_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT date, cash, positions_value, total_value, daily_return
             FROM equity_curve WHERE result_id = ?1 ORDER BY id",
        )?;
        let equity_curve = stmt
            .query_map(params![id], point_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let run_metrics = metrics::compute(
            &equity_curve,
            &trades,
            config.initial_capital,
            config.risk_free_rate,
        );

        Ok(BacktestResult {
            config,
            metrics: run_metrics,
            trades,
            equity_curve,
            start_date,
            end_date,
            execution_time: Duration::from_millis(execution_time_ms.max(0) as u64),
        })
    }

    /// Header summaries for the requested ids, in the requested order.
    pub fn summaries(&self, ids: &[i64]) -> Result<Vec<ResultSummary>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let summary = self
                .conn
                .query_row(
                    "SELECT id, strategy_id, start_date, end_date, total_return,
                            cagr, sharpe, max_drawdown, win_rate, total_trades,
                            execution_time_ms
                     FROM results WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, f64>(6)?,
                            row.get::<_, f64>(7)?,
                            row.get::<_, f64>(8)?,
                            row.get::<_, i64>(9)?,
                            row.get::<_, i64>(10)?,
                        ))
                    },
                )
                .with_context(|| format!("no saved result with id {id}"))?;
            out.push(ResultSummary {
                id: summary.0,
                strategy_id: summary.1,
                start_date: parse_date(&summary.2)?,
                end_date: parse_date(&summary.3)?,
                total_return: summary.4,
                cagr: summary.5,
                sharpe: summary.6,
                max_drawdown: summary.7,
                win_rate: summary.8,
                total_trades: summary.9,
                execution_time_ms: summary.10,
            });
        }
        Ok(out)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("bad date column: {raw}"))
}

fn decimal_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn optional_decimal_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Decimal::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    })
    .transpose()
}

fn region_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Region> {
    let raw: String = row.get(idx)?;
    Region::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn optional_date_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    })
    .transpose()
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let shares: i64 = row.get(4)?;
    let exit_reason: Option<String> = row.get(17)?;
    Ok(Trade {
        ticker: row.get(0)?,
        region: region_column(row, 1)?,
        entry_date: date_column(row, 2)?,
        entry_price: decimal_column(row, 3)?,
        shares: shares.max(0) as u64,
        stop_loss_price: decimal_column(row, 5)?,
        profit_target_price: decimal_column(row, 6)?,
        pattern_tag: row.get(7)?,
        entry_score: row.get(8)?,
        predicted_win_rate: row.get(9)?,
        sector_tag: row.get(10)?,
        exit_date: optional_date_column(row, 11)?,
        exit_price: optional_decimal_column(row, 12)?,
        commission_paid: decimal_column(row, 13)?,
        slippage_paid: decimal_column(row, 14)?,
        realized_pnl: optional_decimal_column(row, 15)?,
        realized_return: row.get(16)?,
        exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
    })
}

fn point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EquityPoint> {
    Ok(EquityPoint {
        date: date_column(row, 0)?,
        cash: decimal_column(row, 1)?,
        positions_value: decimal_column(row, 2)?,
        total_value: decimal_column(row, 3)?,
        daily_return: row.get(4)?,
    })
}
