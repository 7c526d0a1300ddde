use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::BacktestConfig;
use crate::data::Region;

/// Order side. Signs the slippage drift and the tick-rounding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// Why a trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    StrategySell,
    EndOfBacktest,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::StrategySell => "strategy_sell",
            ExitReason::EndOfBacktest => "end_of_backtest",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "profit_target" => Some(ExitReason::ProfitTarget),
            "stop_loss" => Some(ExitReason::StopLoss),
            "strategy_sell" => Some(ExitReason::StrategySell),
            "end_of_backtest" => Some(ExitReason::EndOfBacktest),
            "manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

/// Book key: one open position per (ticker, region).
pub type PositionKey = (String, Region);

/// An open holding. Created on a buy fill, destroyed on the sell fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub region: Region,
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub shares: u64,
    pub stop_loss_price: Decimal,
    pub profit_target_price: Decimal,
    pub pattern_tag: String,
    pub entry_score: f64,
    pub predicted_win_rate: Option<f64>,
    pub sector_tag: String,
    /// Most recent close used for valuation; starts at the entry price.
    pub last_close: Decimal,
    /// Most recent trailing average volume, for sell-side slippage.
    pub last_avg_volume: Option<u64>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        (self.ticker.clone(), self.region)
    }

    /// Marked value at the last known close.
    pub fn market_value(&self) -> Decimal {
        self.last_close * Decimal::from(self.shares)
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.last_close - self.entry_price) * Decimal::from(self.shares)
    }
}

/// The complete record of a round trip (or still-open leg). Closed trades
/// are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub region: Region,
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub shares: u64,
    pub stop_loss_price: Decimal,
    pub profit_target_price: Decimal,
    pub pattern_tag: String,
    pub entry_score: f64,
    pub predicted_win_rate: Option<f64>,
    pub sector_tag: String,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<Decimal>,
    pub commission_paid: Decimal,
    pub slippage_paid: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub realized_return: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn open_from(position: &Position, commission: Decimal, slippage: Decimal) -> Self {
        Self {
            ticker: position.ticker.clone(),
            region: position.region,
            entry_date: position.entry_date,
            entry_price: position.entry_price,
            shares: position.shares,
            stop_loss_price: position.stop_loss_price,
            profit_target_price: position.profit_target_price,
            pattern_tag: position.pattern_tag.clone(),
            entry_score: position.entry_score,
            predicted_win_rate: position.predicted_win_rate,
            sector_tag: position.sector_tag.clone(),
            exit_date: None,
            exit_price: None,
            commission_paid: commission,
            slippage_paid: slippage,
            realized_pnl: None,
            realized_return: None,
            exit_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_date.is_none()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Holding period in calendar days; zero while open.
    pub fn holding_days(&self) -> i64 {
        self.exit_date
            .map_or(0, |exit| (exit - self.entry_date).num_days())
    }
}

/// A strategy's ranked entry proposal.
#[derive(Debug, Clone)]
pub struct BuyCandidate {
    pub ticker: String,
    pub region: Region,
    pub pattern_tag: String,
    pub entry_score: f64,
    /// Gross notional the strategy wants deployed, before the engine's
    /// Kelly scaling.
    pub intended_notional: Decimal,
    pub predicted_win_rate: Option<f64>,
}

/// A strategy-level decision to close an open position.
#[derive(Debug, Clone)]
pub struct SellIntent {
    pub ticker: String,
    pub region: Region,
    pub reason: ExitReason,
}

/// An exit produced by the stop/target rules: price is already resolved.
#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub ticker: String,
    pub region: Region,
    pub price: Decimal,
    pub reason: ExitReason,
}

/// Result of `attempt_buy`. Rejections are normal control flow, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyOutcome {
    Filled { shares: u64, fill_price: Decimal },
    DuplicatePosition,
    NoSnapshot,
    BelowMinLot,
    CashReserveBreach,
    PositionLimit,
    SectorLimit,
}

impl BuyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BuyOutcome::Filled { .. } => "filled",
            BuyOutcome::DuplicatePosition => "duplicate_position",
            BuyOutcome::NoSnapshot => "no_snapshot",
            BuyOutcome::BelowMinLot => "below_min_lot",
            BuyOutcome::CashReserveBreach => "cash_reserve_breach",
            BuyOutcome::PositionLimit => "position_limit",
            BuyOutcome::SectorLimit => "sector_limit",
        }
    }
}

/// One equity-curve sample per trading day, taken after all fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub cash: Decimal,
    pub positions_value: Decimal,
    pub total_value: Decimal,
    /// Relative to the previous sample (or initial capital for the first).
    pub daily_return: f64,
}

/// Read-only portfolio state handed to strategies.
#[derive(Debug, Clone)]
pub struct PortfolioView {
    pub cash: Decimal,
    pub positions_value: Decimal,
    pub total_value: Decimal,
    pub open_keys: Vec<PositionKey>,
}

impl PortfolioView {
    pub fn holds(&self, ticker: &str, region: Region) -> bool {
        self.open_keys
            .iter()
            .any(|(t, r)| t == ticker && *r == region)
    }
}

/// Return metrics of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnMetrics {
    pub total_return: f64,
    pub cagr: f64,
}

/// Risk metrics derived from the daily-return series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    pub annualized_std: f64,
    pub downside_deviation: f64,
    /// Depth of the worst peak-to-trough decline (a negative number).
    pub max_drawdown: f64,
    /// Calendar days from peak to recovery (or to end of series).
    pub max_drawdown_days: i64,
    pub calmar: f64,
}

/// Trade-level metrics, computed over closed trades only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingMetrics {
    pub total_closed: usize,
    pub winners: usize,
    pub losers: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win_return: f64,
    pub avg_loss_return: f64,
    pub win_loss_ratio: f64,
    pub avg_holding_days: f64,
}

/// The full metrics bundle of a run, including the partitioned views.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub returns: ReturnMetrics,
    pub risk: RiskMetrics,
    pub trading: TradingMetrics,
    pub by_pattern: BTreeMap<String, TradingMetrics>,
    pub by_region: BTreeMap<String, TradingMetrics>,
    /// Per-pattern accuracy of strategy-predicted win rates, when supplied.
    pub kelly_accuracy: BTreeMap<String, f64>,
}

/// Immutable record returned to the caller once the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub metrics: RunMetrics,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub execution_time: Duration,
}

impl BacktestResult {
    pub fn final_value(&self) -> Decimal {
        self.equity_curve
            .last()
            .map_or(self.config.initial_capital, |p| p.total_value)
    }

    pub fn final_value_f64(&self) -> f64 {
        self.final_value().to_f64().unwrap_or(0.0)
    }
}
