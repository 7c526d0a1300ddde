use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{rank_and_truncate, Strategy};
use crate::data::{DataProvider, Region, Snapshot};
use crate::engine::types::{BuyCandidate, ExitReason, PortfolioView, Position, SellIntent};

pub const ID: &str = "stage_breakout";
const PATTERN: &str = "Stage2";

/// Stage-2 momentum breakout: enter names trading in a confirmed uptrend
/// (close above the 50-day average, itself above the 200-day) as they press
/// against their 52-week high on expanding volume. Exit when the close
/// falls back through the 50-day average.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageBreakoutParams {
    /// How close to the 52-week high a close must be: 0.05 = within 5%.
    pub proximity_to_high: f64,
    /// Today's volume must be at least this multiple of the 20-day average.
    pub volume_surge: f64,
    /// Fraction of portfolio value proposed per entry.
    pub position_fraction: f64,
    /// Proposals per day, after ranking.
    pub max_candidates: usize,
    /// Optional self-assessed win rate attached to each candidate.
    pub predicted_win_rate: Option<f64>,
}

impl Default for StageBreakoutParams {
    fn default() -> Self {
        Self {
            proximity_to_high: 0.05,
            volume_surge: 1.5,
            position_fraction: 0.10,
            max_candidates: 5,
            predicted_win_rate: None,
        }
    }
}

#[derive(Debug)]
pub struct StageBreakout {
    params: StageBreakoutParams,
}

impl StageBreakout {
    pub fn new(params: StageBreakoutParams) -> Self {
        Self { params }
    }

    fn score(&self, snap: &Snapshot) -> Option<f64> {
        let close = snap.close;
        let sma_50 = snap.sma_50?;
        let sma_200 = snap.sma_200?;
        let avg_volume = snap.avg_volume_20?;
        if avg_volume == 0 {
            return None;
        }

        if !(close > sma_50 && sma_50 > sma_200) {
            return None;
        }

        let proximity = Decimal::from_f64(1.0 - self.params.proximity_to_high)?;
        if close < snap.high_52w * proximity {
            return None;
        }

        let participation = snap.volume as f64 / avg_volume as f64;
        if participation < self.params.volume_surge {
            return None;
        }

        // Stronger trends on heavier participation rank first.
        let trend = ((close - sma_200) / sma_200).to_f64().unwrap_or(0.0);
        Some(trend * participation)
    }
}

impl Strategy for StageBreakout {
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
            if let Some(score) = self.score(&snap) {
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
            if let Some(sma_50) = snap.sma_50 {
                if snap.close < sma_50 {
                    intents.push(SellIntent {
                        ticker: position.ticker.clone(),
                        region: position.region,
                        reason: ExitReason::StrategySell,
                    });
                }
            }
        }
        intents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, MemoryProvider};
    use rust_decimal_macros::dec;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 1).unwrap() + chrono::Duration::days(i64::from(day) - 1)
    }

    /// A steadily rising series long enough to fill the 200-day average,
    /// with an optional volume spike on the final bar.
    fn rising_bars(days: u32, final_volume: u64) -> Vec<Bar> {
        (1..=days)
            .map(|d| {
                let close = Decimal::from(100 + d);
                Bar {
                    date: date(d),
                    open: close - dec!(1),
                    high: close + dec!(1),
                    low: close - dec!(2),
                    close,
                    volume: if d == days { final_volume } else { 100_000 },
                }
            })
            .collect()
    }

    fn view() -> PortfolioView {
        PortfolioView {
            cash: dec!(1000000),
            positions_value: dec!(0),
            total_value: dec!(1000000),
            open_keys: Vec::new(),
        }
    }

    #[test]
    fn breakout_on_volume_is_proposed() {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, rising_bars(260, 250_000))
            .unwrap();
        let mut strategy = StageBreakout::new(StageBreakoutParams::default());
        let universe = vec!["AAA".to_string()];
        let candidates =
            strategy.rank_buys(&universe, Region::Kr, date(260), &provider, &view());
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.pattern_tag, "Stage2");
        assert_eq!(candidate.intended_notional, dec!(100000));
        assert!(candidate.entry_score > 0.0);
    }

    #[test]
    fn quiet_volume_is_ignored() {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, rising_bars(260, 100_000))
            .unwrap();
        let mut strategy = StageBreakout::new(StageBreakoutParams::default());
        let universe = vec!["AAA".to_string()];
        let candidates =
            strategy.rank_buys(&universe, Region::Kr, date(260), &provider, &view());
        assert!(candidates.is_empty());
    }

    #[test]
    fn young_listing_without_long_average_is_ignored() {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, rising_bars(60, 250_000))
            .unwrap();
        let mut strategy = StageBreakout::new(StageBreakoutParams::default());
        let universe = vec!["AAA".to_string()];
        let candidates =
            strategy.rank_buys(&universe, Region::Kr, date(60), &provider, &view());
        assert!(candidates.is_empty());
    }

    #[test]
    fn held_tickers_are_not_reproposed() {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, rising_bars(260, 250_000))
            .unwrap();
        let mut strategy = StageBreakout::new(StageBreakoutParams::default());
        let universe = vec!["AAA".to_string()];
        let mut view = view();
        view.open_keys.push(("AAA".to_string(), Region::Kr));
        let candidates =
            strategy.rank_buys(&universe, Region::Kr, date(260), &provider, &view);
        assert!(candidates.is_empty());
    }

    #[test]
    fn sell_when_close_breaks_the_50_day() {
        let mut provider = MemoryProvider::new();
        let mut bars = rising_bars(260, 100_000);
        // Crash the final close far below the 50-day average.
        let last = bars.last_mut().unwrap();
        last.close = dec!(200);
        last.low = dec!(198);
        last.open = dec!(205);
        provider.add_ticker("AAA", Region::Kr, bars).unwrap();

        let mut strategy = StageBreakout::new(StageBreakoutParams::default());
        let position = Position {
            ticker: "AAA".to_string(),
            region: Region::Kr,
            entry_date: date(250),
            entry_price: dec!(350),
            shares: 100,
            stop_loss_price: dec!(320),
            profit_target_price: dec!(420),
            pattern_tag: "Stage2".to_string(),
            entry_score: 1.0,
            predicted_win_rate: None,
            sector_tag: "Tech".to_string(),
            last_close: dec!(350),
            last_avg_volume: Some(100_000),
        };
        let intents = strategy.decide_sells(&[position], date(260), &provider);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::StrategySell);
    }
}
