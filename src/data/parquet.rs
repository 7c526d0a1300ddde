use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use super::memory::MemoryProvider;
use super::{Bar, Region, TickerMeta};

/// The canonical date column name used internally after normalization.
pub const DATE_COL: &str = "date";

/// Decimal places kept when converting parquet float prices to fixed-point.
/// Six is finer than any supported tick size.
const PRICE_DP: u32 = 6;

/// Loads per-ticker parquet OHLCV files into a `MemoryProvider`.
///
/// Layout: `<root>/<REGION>/<ticker>.parquet`, each file carrying columns
/// `date, open, high, low, close, volume`. An optional `metadata.json` next
/// to the files maps ticker → sector / listing window.
pub struct ParquetProvider;

impl ParquetProvider {
    /// Load every requested region under `root`.
    pub fn load(root: &Path, regions: &[Region]) -> Result<MemoryProvider> {
        let mut provider = MemoryProvider::new();
        for &region in regions {
            let dir = root.join(region.code());
            if !dir.is_dir() {
                bail!("no data directory for region {region}: {}", dir.display());
            }
            let tickers = list_tickers(&dir)?;
            if tickers.is_empty() {
                bail!("no parquet files under {}", dir.display());
            }
            let metadata = load_metadata(&dir)?;
            for ticker in tickers {
                let path = dir.join(format!("{ticker}.parquet"));
                let bars = load_bars(&path)
                    .with_context(|| format!("loading {}", path.display()))?;
                provider
                    .add_ticker(&ticker, region, bars)
                    .map_err(|e| anyhow::anyhow!("{ticker} ({region}): {e}"))?;
                if let Some(meta) = metadata.get(&ticker) {
                    provider.set_metadata(&ticker, region, meta.clone());
                }
                tracing::debug!(%ticker, %region, "loaded ticker table");
            }
            tracing::info!(%region, "loaded region data");
        }
        Ok(provider)
    }

    /// Resolve the data root from `DATA_ROOT`, defaulting to
    /// `~/.swingbt/data`.
    pub fn root_from_env() -> PathBuf {
        match std::env::var("DATA_ROOT") {
            Ok(val) => PathBuf::from(val),
            Err(_) => home_dir().join(".swingbt").join("data"),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
}

/// Parquet file stems under a region directory, sorted.
fn list_tickers(dir: &Path) -> Result<Vec<String>> {
    let mut tickers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "parquet") {
            if let Some(stem) = path.file_stem() {
                tickers.push(stem.to_string_lossy().to_string());
            }
        }
    }
    tickers.sort();
    Ok(tickers)
}

fn load_metadata(dir: &Path) -> Result<FxHashMap<String, TickerMeta>> {
    let path = dir.join("metadata.json");
    if !path.exists() {
        return Ok(FxHashMap::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let path_str = path.to_string_lossy().to_string();
    let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
        .collect()
        .context("failed to read parquet file")?;
    let df = normalize_date_column(df)?;
    frame_to_bars(&df)
}

/// Normalize the date column to a Date column named `date`. Accepts `date`,
/// `trade_date` or `data_date` sources in Date, Datetime, or string form.
pub fn normalize_date_column(df: DataFrame) -> Result<DataFrame> {
    let (src_col, src_dtype) = if let Ok(c) = df.column(DATE_COL) {
        (DATE_COL, c.dtype().clone())
    } else if let Ok(c) = df.column("trade_date") {
        ("trade_date", c.dtype().clone())
    } else if let Ok(c) = df.column("data_date") {
        ("data_date", c.dtype().clone())
    } else {
        bail!("no recognized date column (expected date/trade_date/data_date)");
    };

    let result = match &src_dtype {
        DataType::Date => {
            if src_col == DATE_COL {
                df
            } else {
                df.lazy().rename([src_col], [DATE_COL], true).collect()?
            }
        }
        DataType::Datetime(_, _) | DataType::String => {
            let collected = df
                .lazy()
                .with_column(col(src_col).cast(DataType::Date).alias(DATE_COL))
                .collect()?;
            if src_col == DATE_COL {
                collected
            } else {
                collected.drop(src_col)?
            }
        }
        other => bail!("unsupported dtype for date column: {other:?}"),
    };

    Ok(result)
}

/// Extract a `NaiveDate` from a Date column value at a given index.
fn extract_date(col: &Column, idx: usize) -> Result<NaiveDate> {
    match col.dtype() {
        DataType::Date => {
            let days = col.date()?.phys.get(idx);
            match days {
                Some(d) => chrono::NaiveDate::from_num_days_from_ce_opt(
                    d + 719_163, // epoch offset: days from CE to 1970-01-01
                )
                .ok_or_else(|| anyhow::anyhow!("invalid date at index {idx}")),
                None => bail!("null date at index {idx}"),
            }
        }
        other => bail!("unsupported column type for date extraction: {other:?}"),
    }
}

fn frame_to_bars(df: &DataFrame) -> Result<Vec<Bar>> {
    let dates = df.column(DATE_COL)?;
    let opens = df.column("open")?.f64()?;
    let highs = df.column("high")?.f64()?;
    let lows = df.column("low")?.f64()?;
    let closes = df.column("close")?.f64()?;
    let volumes = df
        .column("volume")?
        .cast(&DataType::Int64)?
        .i64()?
        .clone();

    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let date = extract_date(dates, i)?;
        let bar = Bar {
            date,
            open: price_from_f64(opens.get(i), "open", date)?,
            high: price_from_f64(highs.get(i), "high", date)?,
            low: price_from_f64(lows.get(i), "low", date)?,
            close: price_from_f64(closes.get(i), "close", date)?,
            volume: volumes.get(i).unwrap_or(0).max(0) as u64,
        };
        bars.push(bar);
    }
    Ok(bars)
}

fn price_from_f64(value: Option<f64>, column: &str, date: NaiveDate) -> Result<Decimal> {
    let v = match value {
        Some(v) if v.is_finite() => v,
        _ => bail!("null or non-finite {column} price on {date}"),
    };
    Decimal::from_f64(v)
        .map(|d| d.round_dp(PRICE_DP))
        .ok_or_else(|| anyhow::anyhow!("unrepresentable {column} price {v} on {date}"))
}
