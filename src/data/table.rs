use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::{Bar, Snapshot};
use crate::error::DataError;

const SMA_SHORT: usize = 20;
const SMA_MID: usize = 50;
const SMA_LONG: usize = 200;
const ATR_PERIOD: usize = 14;
const RSI_PERIOD: usize = 14;
const ADV_PERIOD: usize = 20;
const HIGH_WINDOW: usize = 252;

/// Immutable column-oriented daily table for one ticker: one vector per
/// column, all of equal length, with a sorted date index. Row-at-date lookup
/// is a binary search. Indicator columns are computed once at construction
/// from rows at or before each index, so a snapshot at date `D` exposes only
/// facts observable on or before `D`.
#[derive(Debug, Clone)]
pub struct OhlcvTable {
    dates: Vec<NaiveDate>,
    open: Vec<Decimal>,
    high: Vec<Decimal>,
    low: Vec<Decimal>,
    close: Vec<Decimal>,
    volume: Vec<u64>,
    sma_20: Vec<Option<Decimal>>,
    sma_50: Vec<Option<Decimal>>,
    sma_200: Vec<Option<Decimal>>,
    atr_14: Vec<Option<Decimal>>,
    rsi_14: Vec<Option<f64>>,
    avg_volume_20: Vec<Option<u64>>,
    high_52w: Vec<Decimal>,
}

impl OhlcvTable {
    /// Build a table from bars. Bars are sorted by date; duplicate dates are
    /// rejected because the index must be strictly ascending.
    pub fn from_bars(mut bars: Vec<Bar>) -> Result<Self, DataError> {
        bars.sort_by_key(|b| b.date);
        for pair in bars.windows(2) {
            if pair[0].date == pair[1].date {
                return Err(DataError::Store(format!(
                    "duplicate bar date {}",
                    pair[0].date
                )));
            }
        }

        let n = bars.len();
        let mut dates = Vec::with_capacity(n);
        let mut open = Vec::with_capacity(n);
        let mut high = Vec::with_capacity(n);
        let mut low = Vec::with_capacity(n);
        let mut close = Vec::with_capacity(n);
        let mut volume = Vec::with_capacity(n);
        for bar in bars {
            dates.push(bar.date);
            open.push(bar.open);
            high.push(bar.high);
            low.push(bar.low);
            close.push(bar.close);
            volume.push(bar.volume);
        }

        let sma_20 = rolling_mean(&close, SMA_SHORT);
        let sma_50 = rolling_mean(&close, SMA_MID);
        let sma_200 = rolling_mean(&close, SMA_LONG);
        let atr_14 = wilder_atr(&high, &low, &close, ATR_PERIOD);
        let rsi_14 = wilder_rsi(&close, RSI_PERIOD);
        let avg_volume_20 = rolling_mean_volume(&volume, ADV_PERIOD);
        let high_52w = rolling_max(&high, HIGH_WINDOW);

        Ok(Self {
            dates,
            open,
            high,
            low,
            close,
            volume,
            sma_20,
            sma_50,
            sma_200,
            atr_14,
            rsi_14,
            avg_volume_20,
            high_52w,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// True when `date` lies within the table's listed span (inclusive).
    pub fn covers(&self, date: NaiveDate) -> bool {
        match (self.first_date(), self.last_date()) {
            (Some(first), Some(last)) => first <= date && date <= last,
            _ => false,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Exact-match row lookup.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    pub fn bar(&self, idx: usize) -> Bar {
        Bar {
            date: self.dates[idx],
            open: self.open[idx],
            high: self.high[idx],
            low: self.low[idx],
            close: self.close[idx],
            volume: self.volume[idx],
        }
    }

    /// All bars with dates in `[start, end]`.
    pub fn bars_in(&self, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end);
        (lo..hi).map(|i| self.bar(i)).collect()
    }

    /// The point-in-time snapshot for an exact trading day, `None` otherwise.
    pub fn snapshot_at(&self, date: NaiveDate) -> Option<Snapshot> {
        let idx = self.index_of(date)?;
        Some(Snapshot {
            date,
            open: self.open[idx],
            high: self.high[idx],
            low: self.low[idx],
            close: self.close[idx],
            volume: self.volume[idx],
            sma_20: self.sma_20[idx],
            sma_50: self.sma_50[idx],
            sma_200: self.sma_200[idx],
            atr_14: self.atr_14[idx],
            rsi_14: self.rsi_14[idx],
            avg_volume_20: self.avg_volume_20[idx],
            high_52w: self.high_52w[idx],
        })
    }
}

/// Simple moving average over the trailing `period` values, `None` until the
/// window is full.
fn rolling_mean(values: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let divisor = Decimal::from(period as u64);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = Decimal::ZERO;
    for i in 0..values.len() {
        sum += values[i];
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out.push(Some(sum / divisor));
        } else {
            out.push(None);
        }
    }
    out
}

fn rolling_mean_volume(volumes: &[u64], period: usize) -> Vec<Option<u64>> {
    let mut out = Vec::with_capacity(volumes.len());
    let mut sum: u64 = 0;
    for i in 0..volumes.len() {
        sum += volumes[i];
        if i >= period {
            sum -= volumes[i - period];
        }
        if i + 1 >= period {
            out.push(Some(sum / period as u64));
        } else {
            out.push(None);
        }
    }
    out
}

/// Average True Range with Wilder smoothing: seeded with the mean of the
/// first `period` true ranges, then `atr = (prev × (p−1) + tr) / p`.
fn wilder_atr(
    high: &[Decimal],
    low: &[Decimal],
    close: &[Decimal],
    period: usize,
) -> Vec<Option<Decimal>> {
    let n = high.len();
    let mut out = vec![None; n];
    if n < period {
        return out;
    }

    let tr_at = |i: usize| -> Decimal {
        let range = high[i] - low[i];
        if i == 0 {
            return range;
        }
        let prev_close = close[i - 1];
        range
            .max((high[i] - prev_close).abs())
            .max((low[i] - prev_close).abs())
    };

    let divisor = Decimal::from(period as u64);
    let carry = Decimal::from((period - 1) as u64);
    let mut seed = Decimal::ZERO;
    for i in 0..period {
        seed += tr_at(i);
    }
    let mut atr = seed / divisor;
    out[period - 1] = Some(atr);
    for i in period..n {
        atr = (atr * carry + tr_at(i)) / divisor;
        out[i] = Some(atr);
    }
    out
}

/// Relative Strength Index with Wilder smoothing, in `f64`; a bounded
/// oscillator, not money.
fn wilder_rsi(close: &[Decimal], period: usize) -> Vec<Option<f64>> {
    use rust_decimal::prelude::ToPrimitive;

    let n = close.len();
    let mut out = vec![None; n];
    if n <= period {
        return out;
    }

    let delta = |i: usize| -> f64 {
        (close[i] - close[i - 1]).to_f64().unwrap_or(0.0)
    };

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let d = delta(i);
        if d > 0.0 {
            avg_gain += d;
        } else {
            avg_loss += -d;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    let p = period as f64;
    for i in (period + 1)..n {
        let d = delta(i);
        let (gain, loss) = if d > 0.0 { (d, 0.0) } else { (0.0, -d) };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// Rolling max over the trailing `window` values (including the current row).
fn rolling_max(values: &[Decimal], window: usize) -> Vec<Decimal> {
    let mut out = Vec::with_capacity(values.len());
    // Monotonic deque of indices whose values are decreasing.
    let mut deque: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
    for i in 0..values.len() {
        while let Some(&back) = deque.back() {
            if values[back] <= values[i] {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(i);
        if let Some(&front) = deque.front() {
            if i >= window && front <= i - window {
                deque.pop_front();
            }
        }
        out.push(values[*deque.front().expect("deque never empty after push")]);
    }
    out
}
