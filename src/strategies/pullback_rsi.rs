use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{rank_and_truncate, Strategy};
use crate::data::{DataProvider, Region};
use crate::engine::types::{BuyCandidate, ExitReason, PortfolioView, Position, SellIntent};

pub const ID: &str = "pullback_rsi";
const PATTERN: &str = "Pullback";

/// Mean-reversion entry on an oversold dip within a long-term uptrend:
/// close above the 200-day average with RSI under the entry threshold.
/// Exit once RSI recovers through the exit threshold.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PullbackRsiParams {
    pub rsi_entry: f64,
    pub rsi_exit: f64,
    /// Fraction of portfolio value proposed per entry.
    pub position_fraction: f64,
    pub max_candidates: usize,
    pub predicted_win_rate: Option<f64>,
}

impl Default for PullbackRsiParams {
    fn default() -> Self {
        Self {
            rsi_entry: 30.0,
            rsi_exit: 55.0,
            position_fraction: 0.08,
            max_candidates: 5,
            predicted_win_rate: None,
        }
    }
}

#[derive(Debug)]
pub struct PullbackRsi {
    params: PullbackRsiParams,
}

impl PullbackRsi {
    pub fn new(params: PullbackRsiParams) -> Self {
        Self { params }
    }
}

impl Strategy for PullbackRsi {
    fn id(&self) -> &str {
        ID
    }

    fn rank_buys(
        &mut self,
        universe: &[String],
        region: Region,
        date: NaiveDate,
        provider: &dyn DataProvider,
        portfolio: &PortfolioView,
    ) -> Vec<BuyCandidate> {
        let notional = portfolio.total_value
            * Decimal::from_f64(self.params.position_fraction).unwrap_or_default();

        let mut scored = Vec::new();
        for ticker in universe {
            if portfolio.holds(ticker, region) {
                continue;
            }
            let Some(snap) = provider.snapshot(ticker, region, date) else {
                continue;
            };
            let (Some(sma_200), Some(rsi)) = (snap.sma_200, snap.rsi_14) else {
                continue;
            };
            if snap.close <= sma_200 || rsi >= self.params.rsi_entry {
                continue;
            }
            // The deeper the oversold reading, the higher the rank.
            let score = self.params.rsi_entry - rsi;
            scored.push((
                score,
                BuyCandidate {
                    ticker: ticker.clone(),
                    region,
                    pattern_tag: PATTERN.to_string(),
                    entry_score: score,
                    intended_notional: notional,
                    predicted_win_rate: self.params.predicted_win_rate,
                },
            ));
        }

        rank_and_truncate(scored, self.params.max_candidates)
    }

    fn decide_sells(
        &mut self,
        open_positions: &[Position],
        date: NaiveDate,
        provider: &dyn DataProvider,
    ) -> Vec<SellIntent> {
        let mut intents = Vec::new();
        for position in open_positions {
            let Some(snap) = provider.snapshot(&position.ticker, position.region, date) else {
                continue;
            };
            if snap.rsi_14.is_some_and(|rsi| rsi > self.params.rsi_exit) {
                intents.push(SellIntent {
                    ticker: position.ticker.clone(),
                    region: position.region,
                    reason: ExitReason::StrategySell,
                });
            }
        }
        intents
    }
}
