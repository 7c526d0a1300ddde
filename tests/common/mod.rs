#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use swingbt::config::BacktestConfig;
use swingbt::data::{Bar, DataProvider, MemoryProvider, Region};
use swingbt::engine::types::{BuyCandidate, PortfolioView, Position, SellIntent};
use swingbt::strategies::Strategy;

/// Day `n` of the synthetic calendar (consecutive calendar days, so every
/// date in a fixture is a trading day).
pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i64::from(day) - 1)
}

/// A bar around `close` with a fixed ±2 intraday range, so the 14-day ATR
/// settles at 4 and a 2×ATR stop sits 8% under entry.
pub fn bar(day: u32, close: Decimal) -> Bar {
    Bar {
        date: date(day),
        open: close,
        high: close + dec!(2),
        low: close - dec!(2),
        close,
        volume: 100_000,
    }
}

/// `days` flat bars at `close`.
pub fn flat_bars(days: u32, close: Decimal) -> Vec<Bar> {
    (1..=days).map(|d| bar(d, close)).collect()
}

pub fn provider_with(ticker: &str, region: Region, bars: Vec<Bar>) -> MemoryProvider {
    let mut provider = MemoryProvider::new();
    provider.add_ticker(ticker, region, bars).unwrap();
    provider
}

/// A frictionless KR config over the fixture window: zero commission, zero
/// slippage, generous limits. Individual scenarios tighten what they test.
pub fn frictionless_config(days: u32) -> BacktestConfig {
    let mut config = BacktestConfig::new(date(1), date(days), Region::Kr);
    config.commission_rate = Some(0.0);
    config.base_slippage_bps = 0.0;
    config
}

/// Replays a fixed schedule of buy candidates; never issues strategy sells.
/// Exits come from the portfolio's stop/target rules or the end of the run.
#[derive(Debug)]
pub struct ScriptedStrategy {
    buys: BTreeMap<NaiveDate, Vec<BuyCandidate>>,
}

impl ScriptedStrategy {
    pub fn new() -> Self {
        Self {
            buys: BTreeMap::new(),
        }
    }

    pub fn buy(mut self, day: NaiveDate, ticker: &str, region: Region, notional: Decimal) -> Self {
        self.buys.entry(day).or_default().push(BuyCandidate {
            ticker: ticker.to_string(),
            region,
            pattern_tag: "Scripted".to_string(),
            entry_score: 1.0,
            intended_notional: notional,
            predicted_win_rate: None,
        });
        self
    }
}

impl Default for ScriptedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ScriptedStrategy {
    fn id(&self) -> &str {
        "scripted"
    }

    fn rank_buys(
        &mut self,
        _universe: &[String],
        _region: Region,
        day: NaiveDate,
        _provider: &dyn DataProvider,
        _portfolio: &PortfolioView,
    ) -> Vec<BuyCandidate> {
        self.buys.get(&day).cloned().unwrap_or_default()
    }

    fn decide_sells(
        &mut self,
        _open_positions: &[Position],
        _date: NaiveDate,
        _provider: &dyn DataProvider,
    ) -> Vec<SellIntent> {
        Vec::new()
    }
}
