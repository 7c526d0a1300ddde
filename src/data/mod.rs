pub mod memory;
pub mod parquet;
pub mod table;

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::DataError;

pub use memory::MemoryProvider;
pub use table::OhlcvTable;

/// Market jurisdiction. Governs tick sizes, commission rates, and the
/// trading calendar. Serialised as the upper-case exchange code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "KR")]
    Kr,
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "CN")]
    Cn,
    #[serde(rename = "HK")]
    Hk,
    #[serde(rename = "JP")]
    Jp,
    #[serde(rename = "VN")]
    Vn,
}

impl Region {
    pub fn code(self) -> &'static str {
        match self {
            Region::Kr => "KR",
            Region::Us => "US",
            Region::Cn => "CN",
            Region::Hk => "HK",
            Region::Jp => "JP",
            Region::Vn => "VN",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KR" => Ok(Region::Kr),
            "US" => Ok(Region::Us),
            "CN" => Ok(Region::Cn),
            "HK" => Ok(Region::Hk),
            "JP" => Ok(Region::Jp),
            "VN" => Ok(Region::Vn),
            other => Err(format!("unknown region code: {other}")),
        }
    }
}

/// One daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// The point-in-time view of one ticker on one trading day: the day's bar
/// plus indicators computed from rows at or before that day only.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub sma_20: Option<Decimal>,
    pub sma_50: Option<Decimal>,
    pub sma_200: Option<Decimal>,
    pub atr_14: Option<Decimal>,
    pub rsi_14: Option<f64>,
    /// Mean volume over the trailing 20 bars (including today).
    pub avg_volume_20: Option<u64>,
    /// Highest high over the trailing 252 bars (including today).
    pub high_52w: Decimal,
}

/// Static per-ticker metadata (sector classification, listing window).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerMeta {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub listed: Option<NaiveDate>,
    pub delisted: Option<NaiveDate>,
}

/// One published fundamental record. Visible only from `published` onward.
#[derive(Debug, Clone)]
pub struct FundamentalRecord {
    pub published: NaiveDate,
    pub fields: FxHashMap<String, f64>,
}

/// Optional restrictions applied when enumerating the tradable universe.
#[derive(Debug, Clone, Default)]
pub struct UniverseFilter {
    /// Restrict to this explicit ticker set.
    pub tickers: Option<Vec<String>>,
    /// Minimum close price on the as-of date.
    pub min_close: Option<Decimal>,
    /// Minimum trailing 20-day average volume on the as-of date.
    pub min_avg_volume: Option<u64>,
}

/// Read-only point-in-time market data access.
///
/// The hard contract: for any call with an `as_of` (or end) date `D`, the
/// returned data depends only on facts observable on or before `D`. The
/// universe is survivorship-safe: tickers that were later delisted must
/// appear for the dates on which they were live.
///
/// Implementations must be safe for concurrent read access; parallel runs
/// share a single provider.
pub trait DataProvider: Send + Sync {
    /// Bars for `[start, end]`, ascending by date.
    /// Fails with `DataError::Missing` when no rows fall in the range and
    /// `DataError::InvalidRange` when `end < start`.
    fn ohlcv(
        &self,
        ticker: &str,
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError>;

    /// Batched form of `ohlcv`. Returns exactly the data the per-ticker loop
    /// would, and must be at least as fast.
    fn ohlcv_batch(
        &self,
        tickers: &[String],
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FxHashMap<String, Vec<Bar>>, DataError> {
        let mut out = FxHashMap::default();
        for ticker in tickers {
            out.insert(ticker.clone(), self.ohlcv(ticker, region, start, end)?);
        }
        Ok(out)
    }

    /// The row for that exact trading day, or `None` for non-trading days
    /// and missing data. Never fabricates.
    fn snapshot(&self, ticker: &str, region: Region, as_of: NaiveDate) -> Option<Snapshot>;

    /// Tickers listed and tradable on `as_of`, sorted ascending.
    fn universe(
        &self,
        region: Region,
        as_of: NaiveDate,
        filter: Option<&UniverseFilter>,
    ) -> Vec<String>;

    /// The most recent fundamental record published on or before `as_of`,
    /// optionally restricted to the requested fields. Empty when nothing
    /// has been published yet.
    fn fundamentals(
        &self,
        ticker: &str,
        region: Region,
        as_of: NaiveDate,
        fields: Option<&[&str]>,
    ) -> FxHashMap<String, f64>;

    /// The region's trading days within `[start, end]`, ascending.
    fn trading_days(&self, region: Region, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate>;

    /// Static metadata for a ticker, when known.
    fn metadata(&self, ticker: &str, region: Region) -> Option<TickerMeta>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_round_trips_through_str() {
        for region in [
            Region::Kr,
            Region::Us,
            Region::Cn,
            Region::Hk,
            Region::Jp,
            Region::Vn,
        ] {
            assert_eq!(region.code().parse::<Region>().unwrap(), region);
        }
    }

    #[test]
    fn region_parse_is_case_insensitive() {
        assert_eq!("kr".parse::<Region>().unwrap(), Region::Kr);
    }

    #[test]
    fn region_parse_rejects_unknown() {
        assert!("XX".parse::<Region>().is_err());
    }

    #[test]
    fn region_serde_uses_exchange_code() {
        let json = serde_json::to_string(&Region::Jp).unwrap();
        assert_eq!(json, "\"JP\"");
        let back: Region = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Region::Jp);
    }
}
