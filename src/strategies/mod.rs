pub mod pullback_rsi;
pub mod stage_breakout;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;

use crate::data::{DataProvider, Region};
use crate::engine::types::{BuyCandidate, PortfolioView, Position, SellIntent};
use crate::error::ConfigError;

/// The decision interface. Pure with respect to the engine: a strategy may
/// carry its own internal state, but it never mutates the provider or the
/// portfolio, and it may only consult data dated on or before the decision
/// date.
pub trait Strategy: Send + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Ranked entry proposals, best first. Must not propose tickers already
    /// held (the portfolio rejects duplicates regardless).
    fn rank_buys(
        &mut self,
        universe: &[String],
        region: Region,
        date: NaiveDate,
        provider: &dyn DataProvider,
        portfolio: &PortfolioView,
    ) -> Vec<BuyCandidate>;

    /// Positions the strategy wants closed at today's close.
    fn decide_sells(
        &mut self,
        open_positions: &[Position],
        date: NaiveDate,
        provider: &dyn DataProvider,
    ) -> Vec<SellIntent>;
}

/// Sort scored candidates descending, tie-broken by ticker so equal scores
/// rank deterministically, and keep the top `max`.
pub(crate) fn rank_and_truncate(
    mut scored: Vec<(f64, BuyCandidate)>,
    max: usize,
) -> Vec<BuyCandidate> {
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.ticker.cmp(&b.1.ticker))
    });
    scored
        .into_iter()
        .take(max)
        .map(|(_, candidate)| candidate)
        .collect()
}

/// Identifiers of the built-in strategies.
pub fn builtin_ids() -> &'static [&'static str] {
    &[stage_breakout::ID, pullback_rsi::ID]
}

/// Build a boxed strategy from its id and opaque parameter blob. Tagged
/// built-in set; no runtime reflection.
pub fn build_strategy(
    id: &str,
    params: &serde_json::Value,
) -> Result<Box<dyn Strategy>, ConfigError> {
    match id {
        stage_breakout::ID => Ok(Box::new(stage_breakout::StageBreakout::new(params_from(
            id, params,
        )?))),
        pullback_rsi::ID => Ok(Box::new(pullback_rsi::PullbackRsi::new(params_from(
            id, params,
        )?))),
        other => Err(ConfigError::UnknownStrategy(other.to_string())),
    }
}

fn params_from<T: DeserializeOwned + Default>(
    id: &str,
    value: &serde_json::Value,
) -> Result<T, ConfigError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ConfigError::StrategyParams {
        id: id.to_string(),
        message: e.to_string(),
    })
}
