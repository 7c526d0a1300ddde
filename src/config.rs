use chrono::NaiveDate;
use garde::Validate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::Region;
use crate::error::ConfigError;

/// Inputs that parameterise a run. Immutable after construction; referenced
/// by content hash for deduplication of saved results.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestConfig {
    /// Inclusive window; non-trading days are skipped via the provider
    /// calendar.
    #[garde(skip)]
    pub start_date: NaiveDate,
    #[garde(custom(validate_window(&self.start_date)))]
    pub end_date: NaiveDate,
    /// Exactly one region per run in v1.
    #[garde(length(min = 1, max = 1))]
    pub regions: Vec<Region>,
    /// Optional restriction of the universe.
    #[serde(default)]
    #[garde(skip)]
    pub tickers: Option<Vec<String>>,
    #[garde(custom(validate_positive_money))]
    pub initial_capital: Decimal,
    #[garde(length(min = 1))]
    pub strategy_id: String,
    /// Opaque to the engine; consumed by the strategy factory.
    #[serde(default)]
    #[garde(skip)]
    pub strategy_params: serde_json::Value,
    /// Scales the notional proposed by the strategy; in (0, 1].
    #[serde(default = "default_kelly_multiplier")]
    #[garde(custom(validate_unit_half_open_high))]
    pub kelly_multiplier: f64,
    /// Per-position cap of portfolio value; in (0, 1).
    #[serde(default = "default_max_position_fraction")]
    #[garde(custom(validate_unit_open))]
    pub max_position_fraction: f64,
    /// Per-sector cap of portfolio value; in (0, 1).
    #[serde(default = "default_max_sector_fraction")]
    #[garde(custom(validate_unit_open))]
    pub max_sector_fraction: f64,
    /// Lower bound on cash / portfolio value after any buy; in [0, 1).
    #[serde(default = "default_min_cash_fraction")]
    #[garde(custom(validate_unit_half_open_low))]
    pub min_cash_fraction: f64,
    #[serde(default = "default_stop_loss_atr_multiplier")]
    #[garde(custom(validate_positive))]
    pub stop_loss_atr_multiplier: f64,
    /// Clamp bounds on the stop distance relative to entry; each in (0, 1).
    #[serde(default = "default_stop_loss_min")]
    #[garde(custom(validate_unit_open))]
    pub stop_loss_min: f64,
    #[serde(default = "default_stop_loss_max")]
    #[garde(custom(validate_unit_open), custom(validate_gte(&self.stop_loss_min)))]
    pub stop_loss_max: f64,
    /// Relative distance of the profit target above entry; e.g. 0.20 = 20%.
    #[serde(default = "default_profit_target")]
    #[garde(custom(validate_positive))]
    pub profit_target: f64,
    /// Overrides the per-region commission table when set.
    #[serde(default)]
    #[garde(inner(range(min = 0.0)))]
    pub commission_rate: Option<f64>,
    /// Minimum commission per fill, when the broker charges a floor.
    #[serde(default)]
    #[garde(custom(validate_optional_non_negative_money))]
    pub commission_min: Option<Decimal>,
    #[serde(default = "default_base_slippage_bps")]
    #[garde(range(min = 0.0))]
    pub base_slippage_bps: f64,
    /// Annual risk-free rate used by the Sharpe numerator.
    #[serde(default)]
    #[garde(skip)]
    pub risk_free_rate: f64,
}

fn default_kelly_multiplier() -> f64 {
    1.0
}
fn default_max_position_fraction() -> f64 {
    0.20
}
fn default_max_sector_fraction() -> f64 {
    0.40
}
fn default_min_cash_fraction() -> f64 {
    0.10
}
fn default_stop_loss_atr_multiplier() -> f64 {
    2.0
}
fn default_stop_loss_min() -> f64 {
    0.03
}
fn default_stop_loss_max() -> f64 {
    0.15
}
fn default_profit_target() -> f64 {
    0.20
}
fn default_base_slippage_bps() -> f64 {
    10.0
}

fn validate_window(start: &NaiveDate) -> impl FnOnce(&NaiveDate, &()) -> garde::Result + '_ {
    move |end: &NaiveDate, (): &()| {
        if end < start {
            return Err(garde::Error::new(format!(
                "end_date ({end}) precedes start_date ({start})"
            )));
        }
        Ok(())
    }
}

fn validate_gte(lower: &f64) -> impl FnOnce(&f64, &()) -> garde::Result + '_ {
    move |value: &f64, (): &()| {
        if value < lower {
            return Err(garde::Error::new(format!(
                "value ({value}) must be >= {lower}"
            )));
        }
        Ok(())
    }
}

fn validate_positive_money(value: &Decimal, (): &()) -> garde::Result {
    if *value <= Decimal::ZERO {
        return Err(garde::Error::new(format!("must be positive, got {value}")));
    }
    Ok(())
}

fn validate_optional_non_negative_money(value: &Option<Decimal>, (): &()) -> garde::Result {
    if let Some(v) = value {
        if *v < Decimal::ZERO {
            return Err(garde::Error::new(format!(
                "must be non-negative, got {v}"
            )));
        }
    }
    Ok(())
}

fn validate_positive(value: &f64, (): &()) -> garde::Result {
    if *value <= 0.0 {
        return Err(garde::Error::new(format!("must be positive, got {value}")));
    }
    Ok(())
}

/// (0, 1) exclusive on both ends.
fn validate_unit_open(value: &f64, (): &()) -> garde::Result {
    if *value <= 0.0 || *value >= 1.0 {
        return Err(garde::Error::new(format!(
            "must be strictly between 0 and 1, got {value}"
        )));
    }
    Ok(())
}

/// (0, 1], zero excluded.
fn validate_unit_half_open_high(value: &f64, (): &()) -> garde::Result {
    if *value <= 0.0 || *value > 1.0 {
        return Err(garde::Error::new(format!(
            "must be in (0, 1], got {value}"
        )));
    }
    Ok(())
}

/// [0, 1), one excluded.
fn validate_unit_half_open_low(value: &f64, (): &()) -> garde::Result {
    if *value < 0.0 || *value >= 1.0 {
        return Err(garde::Error::new(format!(
            "must be in [0, 1), got {value}"
        )));
    }
    Ok(())
}

impl BacktestConfig {
    /// A config with defaults for everything but the window and region.
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, region: Region) -> Self {
        Self {
            start_date,
            end_date,
            regions: vec![region],
            tickers: None,
            initial_capital: Decimal::from(1_000_000u64),
            strategy_id: "stage_breakout".to_string(),
            strategy_params: serde_json::Value::Null,
            kelly_multiplier: default_kelly_multiplier(),
            max_position_fraction: default_max_position_fraction(),
            max_sector_fraction: default_max_sector_fraction(),
            min_cash_fraction: default_min_cash_fraction(),
            stop_loss_atr_multiplier: default_stop_loss_atr_multiplier(),
            stop_loss_min: default_stop_loss_min(),
            stop_loss_max: default_stop_loss_max(),
            profit_target: default_profit_target(),
            commission_rate: None,
            commission_min: None,
            base_slippage_bps: default_base_slippage_bps(),
            risk_free_rate: 0.0,
        }
    }

    /// Validate all parameter constraints. Fatal before any trading day runs.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))
    }

    /// The run's single region. Call after `check`.
    pub fn region(&self) -> Region {
        self.regions
            .first()
            .copied()
            .expect("validated config has exactly one region")
    }

    /// Content hash of the canonical JSON encoding, for result dedup.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }
}
