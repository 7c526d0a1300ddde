use chrono::NaiveDate;
use thiserror::Error;

use crate::data::Region;

/// Configuration problems detected before any trading day executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown strategy id: {0}")]
    UnknownStrategy(String),

    #[error("invalid parameters for strategy '{id}': {message}")]
    StrategyParams { id: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Failures surfaced by a `DataProvider`. Never silently substituted.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("data missing for {ticker} ({region}){}", fmt_date(.date))]
    Missing {
        ticker: String,
        region: Region,
        date: Option<NaiveDate>,
    },

    #[error("invalid date range: end {end} precedes start {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("data store error: {0}")]
    Store(String),
}

fn fmt_date(date: &Option<NaiveDate>) -> String {
    date.map(|d| format!(" as of {d}")).unwrap_or_default()
}

/// Typed error returned by the run API. Portfolio-logic rejections are
/// deliberately absent: they are `BuyOutcome` values, not errors.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("portfolio invariant violated: {0}")]
    Invariant(String),

    #[error("run cancelled")]
    Cancelled,
}
