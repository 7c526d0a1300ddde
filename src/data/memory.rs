use std::collections::BTreeSet;

use chrono::NaiveDate;
use rustc_hash::FxHashMap;

use super::table::OhlcvTable;
use super::{Bar, DataProvider, FundamentalRecord, Region, Snapshot, TickerMeta, UniverseFilter};
use crate::error::DataError;

type Key = (String, Region);

/// In-memory `DataProvider` backed by immutable column tables, one per
/// `(ticker, region)`. Built once, then shared read-only across runs.
#[derive(Default)]
pub struct MemoryProvider {
    tables: FxHashMap<Key, OhlcvTable>,
    meta: FxHashMap<Key, TickerMeta>,
    fundamentals: FxHashMap<Key, Vec<FundamentalRecord>>,
    calendars: FxHashMap<Region, Vec<NaiveDate>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ticker's bar history. Replaces any existing table for the key
    /// and refreshes the region calendar.
    pub fn add_ticker(
        &mut self,
        ticker: &str,
        region: Region,
        bars: Vec<Bar>,
    ) -> Result<(), DataError> {
        let table = OhlcvTable::from_bars(bars)?;
        self.tables.insert((ticker.to_string(), region), table);
        self.rebuild_calendar(region);
        Ok(())
    }

    pub fn set_metadata(&mut self, ticker: &str, region: Region, meta: TickerMeta) {
        self.meta.insert((ticker.to_string(), region), meta);
    }

    /// Record a fundamental publication. Records are kept sorted by
    /// publication date so the as-of lookup is a partition point.
    pub fn add_fundamentals(
        &mut self,
        ticker: &str,
        region: Region,
        published: NaiveDate,
        fields: FxHashMap<String, f64>,
    ) {
        let records = self
            .fundamentals
            .entry((ticker.to_string(), region))
            .or_default();
        records.push(FundamentalRecord { published, fields });
        records.sort_by_key(|r| r.published);
    }

    pub fn table(&self, ticker: &str, region: Region) -> Option<&OhlcvTable> {
        self.tables.get(&(ticker.to_string(), region))
    }

    fn rebuild_calendar(&mut self, region: Region) {
        let mut days = BTreeSet::new();
        for ((_, r), table) in &self.tables {
            if *r == region {
                days.extend(table.dates().iter().copied());
            }
        }
        self.calendars.insert(region, days.into_iter().collect());
    }

    /// True when the ticker was listed and tradable on `as_of`: its data
    /// span covers the date and any metadata listing window agrees. Tickers
    /// whose data ends before `as_of` (delistings) drop out naturally, which
    /// is what keeps the universe survivorship-safe.
    fn live_on(&self, key: &Key, as_of: NaiveDate) -> bool {
        let Some(table) = self.tables.get(key) else {
            return false;
        };
        if !table.covers(as_of) {
            return false;
        }
        if let Some(meta) = self.meta.get(key) {
            if meta.listed.is_some_and(|d| as_of < d) {
                return false;
            }
            if meta.delisted.is_some_and(|d| as_of >= d) {
                return false;
            }
        }
        true
    }
}

impl DataProvider for MemoryProvider {
    fn ohlcv(
        &self,
        ticker: &str,
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        if end < start {
            return Err(DataError::InvalidRange { start, end });
        }
        let table = self
            .tables
            .get(&(ticker.to_string(), region))
            .ok_or_else(|| DataError::Missing {
                ticker: ticker.to_string(),
                region,
                date: None,
            })?;
        let bars = table.bars_in(start, end);
        if bars.is_empty() {
            return Err(DataError::Missing {
                ticker: ticker.to_string(),
                region,
                date: Some(start),
            });
        }
        Ok(bars)
    }

    fn snapshot(&self, ticker: &str, region: Region, as_of: NaiveDate) -> Option<Snapshot> {
        self.tables
            .get(&(ticker.to_string(), region))?
            .snapshot_at(as_of)
    }

    fn universe(
        &self,
        region: Region,
        as_of: NaiveDate,
        filter: Option<&UniverseFilter>,
    ) -> Vec<String> {
        let mut out: Vec<String> = self
            .tables
            .keys()
            .filter(|(_, r)| *r == region)
            .filter(|key| self.live_on(key, as_of))
            .filter(|key| match filter {
                Some(f) => passes_filter(self, key, as_of, f),
                None => true,
            })
            .map(|(ticker, _)| ticker.clone())
            .collect();
        out.sort();
        out
    }

    fn fundamentals(
        &self,
        ticker: &str,
        region: Region,
        as_of: NaiveDate,
        fields: Option<&[&str]>,
    ) -> FxHashMap<String, f64> {
        let Some(records) = self.fundamentals.get(&(ticker.to_string(), region)) else {
            return FxHashMap::default();
        };
        // Latest record published on or before as_of.
        let idx = records.partition_point(|r| r.published <= as_of);
        if idx == 0 {
            return FxHashMap::default();
        }
        let record = &records[idx - 1];
        match fields {
            None => record.fields.clone(),
            Some(wanted) => wanted
                .iter()
                .filter_map(|name| {
                    record
                        .fields
                        .get(*name)
                        .map(|v| ((*name).to_string(), *v))
                })
                .collect(),
        }
    }

    fn trading_days(&self, region: Region, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        match self.calendars.get(&region) {
            Some(days) => days
                .iter()
                .copied()
                .filter(|d| *d >= start && *d <= end)
                .collect(),
            None => Vec::new(),
        }
    }

    fn metadata(&self, ticker: &str, region: Region) -> Option<TickerMeta> {
        self.meta.get(&(ticker.to_string(), region)).cloned()
    }
}

fn passes_filter(
    provider: &MemoryProvider,
    key: &Key,
    as_of: NaiveDate,
    filter: &UniverseFilter,
) -> bool {
    if let Some(tickers) = &filter.tickers {
        if !tickers.iter().any(|t| *t == key.0) {
            return false;
        }
    }
    if filter.min_close.is_none() && filter.min_avg_volume.is_none() {
        return true;
    }
    let Some(snap) = provider.tables[key].snapshot_at(as_of) else {
        // Listed but not trading that exact day; price filters can't be
        // evaluated, so the ticker stays out.
        return false;
    };
    if filter.min_close.is_some_and(|min| snap.close < min) {
        return false;
    }
    if filter
        .min_avg_volume
        .is_some_and(|min| snap.avg_volume_20.unwrap_or(0) < min)
    {
        return false;
    }
    true
}
