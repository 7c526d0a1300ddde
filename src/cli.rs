use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Months, NaiveDate};
use clap::{Parser, Subcommand};
use rayon::prelude::*;

use swingbt::config::BacktestConfig;
use swingbt::data::parquet::ParquetProvider;
use swingbt::data::MemoryProvider;
use swingbt::engine::types::BacktestResult;
use swingbt::engine::run_backtest;
use swingbt::error::{BacktestError, ConfigError};
use swingbt::persist::ResultStore;

#[derive(Debug, Parser)]
#[command(
    name = "swingbt",
    version,
    about = "Event-driven daily-bar backtesting for equity swing trading"
)]
pub struct Cli {
    /// Root directory of per-region parquet data. Defaults to $DATA_ROOT,
    /// then ~/.swingbt/data.
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// SQLite file for saved results.
    #[arg(long, global = true, default_value = "swingbt.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one backtest from a TOML config file.
    Run {
        config: PathBuf,
        /// Persist the result to the database.
        #[arg(long)]
        save: bool,
    },
    /// Run every combination in a parameter-grid file.
    Sweep {
        grid: PathBuf,
        /// Persist each result to the database.
        #[arg(long)]
        save: bool,
    },
    /// Rolling out-of-sample evaluation: repeat the run over consecutive
    /// test windows that follow each training span.
    WalkForward {
        config: PathBuf,
        train_months: u32,
        test_months: u32,
    },
    /// Tabulate saved results side by side.
    Compare {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

/// Map an error to the documented process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(backtest) = err.downcast_ref::<BacktestError>() {
        return match backtest {
            BacktestError::Config(_) => 2,
            BacktestError::Data(_) => 3,
            BacktestError::Invariant(_) => 4,
            BacktestError::Cancelled => 5,
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { config, save } => run_one(&config, cli.data_root.as_deref(), save, &cli.db),
        Command::Sweep { grid, save } => sweep(&grid, cli.data_root.as_deref(), save, &cli.db),
        Command::WalkForward {
            config,
            train_months,
            test_months,
        } => walk_forward(&config, cli.data_root.as_deref(), train_months, test_months),
        Command::Compare { ids } => compare(&ids, &cli.db),
    }
}

fn load_config(path: &Path) -> Result<BacktestConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    BacktestConfig::from_toml_str(&raw).map_err(anyhow::Error::new)
}

fn build_provider(
    data_root: Option<&Path>,
    config: &BacktestConfig,
) -> Result<MemoryProvider> {
    let root = data_root
        .map(Path::to_path_buf)
        .unwrap_or_else(ParquetProvider::root_from_env);
    ParquetProvider::load(&root, &config.regions)
}

fn run_one(config_path: &Path, data_root: Option<&Path>, save: bool, db: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let provider = build_provider(data_root, &config)?;
    let result = run_backtest(&config, &provider, None)?;
    print_summary(&result);
    if save {
        let mut store = ResultStore::open(db)?;
        let id = store.save(&result)?;
        println!("saved as result {id}");
    }
    Ok(())
}

/// Grid file: a `[base]` config table plus a `[grid]` table mapping config
/// keys to candidate values. Every combination of grid values runs once.
#[derive(Debug, serde::Deserialize)]
struct SweepFile {
    base: BacktestConfig,
    #[serde(default)]
    grid: BTreeMap<String, Vec<toml::Value>>,
}

fn sweep(grid_path: &Path, data_root: Option<&Path>, save: bool, db: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(grid_path)
        .with_context(|| format!("reading grid file {}", grid_path.display()))?;
    let sweep_file: SweepFile = toml::from_str(&raw)
        .map_err(|e| anyhow::Error::new(ConfigError::Parse(e.to_string())))?;
    let configs = expand_grid(&sweep_file.base, &sweep_file.grid)?;
    if configs.is_empty() {
        bail!("grid expands to zero configurations");
    }
    println!("sweeping {} configurations", configs.len());

    let provider = build_provider(data_root, &sweep_file.base)?;

    // Independent runs in parallel; each owns its portfolio and engine,
    // sharing only the read-only provider.
    let outcomes: Vec<(usize, Result<BacktestResult, BacktestError>)> = configs
        .par_iter()
        .enumerate()
        .map(|(i, config)| (i, run_backtest(config, &provider, None)))
        .collect();

    let mut rows = Vec::new();
    let mut store = if save {
        Some(ResultStore::open(db)?)
    } else {
        None
    };
    for (i, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if let Some(store) = store.as_mut() {
                    store.save(&result)?;
                }
                rows.push((i, result));
            }
            Err(err) => eprintln!("configuration {i} failed: {err}"),
        }
    }

    rows.sort_by(|a, b| {
        b.1.metrics
            .returns
            .total_return
            .partial_cmp(&a.1.metrics.returns.total_return)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    println!(
        "{:<6} {:>10} {:>8} {:>8} {:>9} {:>7}",
        "config", "return", "cagr", "sharpe", "max dd", "trades"
    );
    for (i, result) in &rows {
        println!(
            "{:<6} {:>9.2}% {:>7.2}% {:>8.2} {:>8.2}% {:>7}",
            i,
            result.metrics.returns.total_return * 100.0,
            result.metrics.returns.cagr * 100.0,
            result.metrics.risk.sharpe,
            result.metrics.risk.max_drawdown * 100.0,
            result.trades.len()
        );
    }
    Ok(())
}

/// Cartesian expansion of the grid over the base config. Overrides are
/// applied through the config's JSON representation so any top-level key
/// can be swept.
fn expand_grid(
    base: &BacktestConfig,
    grid: &BTreeMap<String, Vec<toml::Value>>,
) -> Result<Vec<BacktestConfig>> {
    let mut blobs = vec![serde_json::to_value(base)?];
    for (key, values) in grid {
        if values.is_empty() {
            bail!("grid key '{key}' has no values");
        }
        let mut next = Vec::with_capacity(blobs.len() * values.len());
        for blob in &blobs {
            for value in values {
                let mut cloned = blob.clone();
                let Some(object) = cloned.as_object_mut() else {
                    bail!("config did not serialise to an object");
                };
                object.insert(key.clone(), serde_json::to_value(value)?);
                next.push(cloned);
            }
        }
        blobs = next;
    }

    blobs
        .into_iter()
        .map(|blob| {
            let config: BacktestConfig = serde_json::from_value(blob)
                .map_err(|e| anyhow::Error::new(ConfigError::Parse(e.to_string())))?;
            config.check().map_err(anyhow::Error::new)?;
            Ok(config)
        })
        .collect()
}

fn walk_forward(
    config_path: &Path,
    data_root: Option<&Path>,
    train_months: u32,
    test_months: u32,
) -> Result<()> {
    if train_months == 0 || test_months == 0 {
        bail!("train and test spans must be at least one month");
    }
    let base = load_config(config_path)?;
    let provider = build_provider(data_root, &base)?;

    let windows = walk_forward_windows(
        base.start_date,
        base.end_date,
        train_months,
        test_months,
    );
    if windows.is_empty() {
        bail!(
            "window {}..={} is too short for {train_months}m train + {test_months}m test",
            base.start_date,
            base.end_date
        );
    }

    println!(
        "{:<24} {:>10} {:>8} {:>9} {:>7}",
        "test window", "return", "sharpe", "max dd", "trades"
    );
    for (start, end) in windows {
        let mut config = base.clone();
        config.start_date = start;
        config.end_date = end;
        let result = run_backtest(&config, &provider, None)?;
        println!(
            "{start} … {end} {:>9.2}% {:>8.2} {:>8.2}% {:>7}",
            result.metrics.returns.total_return * 100.0,
            result.metrics.risk.sharpe,
            result.metrics.risk.max_drawdown * 100.0,
            result.trades.len()
        );
    }
    Ok(())
}

/// Consecutive out-of-sample test windows: each follows a training span and
/// lasts `test_months`, stepping forward by `test_months` per round.
fn walk_forward_windows(
    start: NaiveDate,
    end: NaiveDate,
    train_months: u32,
    test_months: u32,
) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut test_start = start + Months::new(train_months);
    while test_start <= end {
        let test_end = (test_start + Months::new(test_months))
            .pred_opt()
            .unwrap_or(end)
            .min(end);
        windows.push((test_start, test_end));
        test_start = test_start + Months::new(test_months);
    }
    windows
}

fn compare(ids: &[i64], db: &Path) -> Result<()> {
    let store = ResultStore::open(db)?;
    let summaries = store.summaries(ids)?;
    println!(
        "{:<5} {:<16} {:<12} {:<12} {:>9} {:>8} {:>8} {:>8} {:>7}",
        "id", "strategy", "start", "end", "return", "cagr", "sharpe", "max dd", "trades"
    );
    for s in summaries {
        println!(
            "{:<5} {:<16} {:<12} {:<12} {:>8.2}% {:>7.2}% {:>8.2} {:>7.2}% {:>7}",
            s.id,
            s.strategy_id,
            s.start_date.to_string(),
            s.end_date.to_string(),
            s.total_return * 100.0,
            s.cagr * 100.0,
            s.sharpe,
            s.max_drawdown * 100.0,
            s.total_trades
        );
    }
    Ok(())
}

fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    println!(
        "{} | {} … {} | {} trading days",
        result.config.strategy_id,
        result.start_date,
        result.end_date,
        result.equity_curve.len()
    );
    println!(
        "final value     {:>16}   total return {:>8.2}%   cagr {:>7.2}%",
        result.final_value(),
        m.returns.total_return * 100.0,
        m.returns.cagr * 100.0
    );
    println!(
        "sharpe {:>6.2}   sortino {:>6.2}   max drawdown {:>7.2}% ({} days)   calmar {:>6.2}",
        m.risk.sharpe,
        m.risk.sortino,
        m.risk.max_drawdown * 100.0,
        m.risk.max_drawdown_days,
        m.risk.calmar
    );
    println!(
        "trades {:>4}   win rate {:>6.1}%   profit factor {:>6.2}   avg hold {:>5.1}d",
        m.trading.total_closed,
        m.trading.win_rate * 100.0,
        m.trading.profit_factor,
        m.trading.avg_holding_days
    );
    for (pattern, pm) in &m.by_pattern {
        println!(
            "  pattern {pattern:<12} trades {:>4}   win rate {:>6.1}%   profit factor {:>6.2}",
            pm.total_closed,
            pm.win_rate * 100.0,
            pm.profit_factor
        );
    }
    println!("elapsed {:?}", result.execution_time);
}
