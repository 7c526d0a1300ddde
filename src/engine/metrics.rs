use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::types::{
    EquityPoint, ReturnMetrics, RiskMetrics, RunMetrics, Trade, TradingMetrics,
};

/// Trading days per year, for annualisation.
const TRADING_DAYS: f64 = 252.0;
/// Calendar days per year, for CAGR.
const CALENDAR_DAYS: f64 = 365.25;

/// Compute the full metrics bundle from the equity curve and trade log.
/// Empty inputs and zero-variance return series produce well-defined
/// sentinels, never a divide-by-zero fault.
pub fn compute(
    equity_curve: &[EquityPoint],
    trades: &[Trade],
    initial_capital: Decimal,
    risk_free_rate: f64,
) -> RunMetrics {
    let closed: Vec<&Trade> = trades.iter().filter(|t| t.is_closed()).collect();

    let mut by_pattern = BTreeMap::new();
    let mut by_region = BTreeMap::new();
    for trade in &closed {
        by_pattern
            .entry(trade.pattern_tag.clone())
            .or_insert_with(Vec::new)
            .push(*trade);
        by_region
            .entry(trade.region.code().to_string())
            .or_insert_with(Vec::new)
            .push(*trade);
    }

    let returns = return_metrics(equity_curve, initial_capital);
    RunMetrics {
        risk: risk_metrics(equity_curve, risk_free_rate, returns.cagr),
        returns,
        trading: trading_metrics(&closed),
        by_pattern: by_pattern
            .into_iter()
            .map(|(tag, group)| (tag, trading_metrics(&group)))
            .collect(),
        by_region: by_region
            .into_iter()
            .map(|(code, group)| (code, trading_metrics(&group)))
            .collect(),
        kelly_accuracy: kelly_accuracy(&closed),
    }
}

fn return_metrics(equity_curve: &[EquityPoint], initial_capital: Decimal) -> ReturnMetrics {
    let initial = initial_capital.to_f64().unwrap_or(0.0);
    let Some(last) = equity_curve.last() else {
        return ReturnMetrics::default();
    };
    if initial <= 0.0 {
        return ReturnMetrics::default();
    }
    let final_value = last.total_value.to_f64().unwrap_or(0.0);
    let total_return = (final_value - initial) / initial;

    let first = &equity_curve[0];
    let years = (last.date - first.date).num_days() as f64 / CALENDAR_DAYS;
    let cagr = if years > 0.0 && final_value > 0.0 {
        (final_value / initial).powf(1.0 / years) - 1.0
    } else {
        0.0
    };

    ReturnMetrics { total_return, cagr }
}

fn risk_metrics(equity_curve: &[EquityPoint], risk_free_rate: f64, cagr: f64) -> RiskMetrics {
    if equity_curve.len() < 2 {
        return RiskMetrics::default();
    }
    let returns: Vec<f64> = equity_curve.iter().map(|p| p.daily_return).collect();

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let std = sample_std(&returns);
    let downside = downside_deviation(&returns);

    let annualized_return = mean * TRADING_DAYS;
    let annualized_std = std * TRADING_DAYS.sqrt();
    let downside_annualized = downside * TRADING_DAYS.sqrt();

    let sharpe = if annualized_std > 0.0 {
        (annualized_return - risk_free_rate) / annualized_std
    } else {
        0.0
    };
    let sortino = if downside_annualized > 0.0 {
        (annualized_return - risk_free_rate) / downside_annualized
    } else {
        0.0
    };

    let (max_drawdown, max_drawdown_days) = max_drawdown(equity_curve);

    // Calmar pairs the run's CAGR with its worst drawdown.
    let calmar = if max_drawdown < 0.0 {
        cagr / max_drawdown.abs()
    } else {
        0.0
    };

    RiskMetrics {
        sharpe,
        sortino,
        annualized_std,
        downside_deviation: downside_annualized,
        max_drawdown,
        max_drawdown_days,
        calmar,
    }
}

/// Scan the running peak. Returns the deepest drawdown (a negative number,
/// zero when the curve never declines) and its duration in calendar days
/// from the peak to recovery, or to the end of the series if never
/// recovered.
fn max_drawdown(equity_curve: &[EquityPoint]) -> (f64, i64) {
    let mut peak = equity_curve[0].total_value;
    let mut peak_idx = 0usize;
    let mut worst = 0.0f64;
    let mut worst_peak_idx = 0usize;

    for (i, point) in equity_curve.iter().enumerate() {
        if point.total_value > peak {
            peak = point.total_value;
            peak_idx = i;
        }
        if peak > Decimal::ZERO {
            let dd = ((point.total_value - peak) / peak).to_f64().unwrap_or(0.0);
            if dd < worst {
                worst = dd;
                worst_peak_idx = peak_idx;
            }
        }
    }

    if worst >= 0.0 {
        return (0.0, 0);
    }

    let peak_value = equity_curve[worst_peak_idx].total_value;
    let peak_date = equity_curve[worst_peak_idx].date;
    let recovery_date = equity_curve[worst_peak_idx + 1..]
        .iter()
        .find(|p| p.total_value >= peak_value)
        .map_or_else(
            || equity_curve.last().map_or(peak_date, |p| p.date),
            |p| p.date,
        );
    (worst, (recovery_date - peak_date).num_days())
}

fn trading_metrics(closed: &[&Trade]) -> TradingMetrics {
    if closed.is_empty() {
        return TradingMetrics::default();
    }

    let total = closed.len();
    let mut winners = 0usize;
    let mut losers = 0usize;
    let mut gross_profit = Decimal::ZERO;
    let mut gross_loss = Decimal::ZERO;
    let mut win_return_sum = 0.0f64;
    let mut loss_return_sum = 0.0f64;
    let mut holding_days_sum = 0i64;

    for trade in closed {
        let pnl = trade.realized_pnl.unwrap_or(Decimal::ZERO);
        let ret = trade.realized_return.unwrap_or(0.0);
        holding_days_sum += trade.holding_days();
        if pnl > Decimal::ZERO {
            winners += 1;
            gross_profit += pnl;
            win_return_sum += ret;
        } else if pnl < Decimal::ZERO {
            losers += 1;
            gross_loss += pnl;
            loss_return_sum += ret;
        }
        // Zero-P&L scratches count toward totals but neither side.
    }

    let win_rate = winners as f64 / total as f64;
    let gross_profit_f = gross_profit.to_f64().unwrap_or(0.0);
    let gross_loss_f = gross_loss.to_f64().unwrap_or(0.0).abs();
    let profit_factor = if gross_loss_f > 0.0 {
        gross_profit_f / gross_loss_f
    } else if gross_profit_f > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win_return = if winners > 0 {
        win_return_sum / winners as f64
    } else {
        0.0
    };
    let avg_loss_return = if losers > 0 {
        loss_return_sum / losers as f64
    } else {
        0.0
    };
    let win_loss_ratio = if avg_loss_return < 0.0 {
        avg_win_return / avg_loss_return.abs()
    } else if avg_win_return > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    TradingMetrics {
        total_closed: total,
        winners,
        losers,
        win_rate,
        profit_factor,
        avg_win_return,
        avg_loss_return,
        win_loss_ratio,
        avg_holding_days: holding_days_sum as f64 / total as f64,
    }
}

/// Accuracy of strategy-supplied win-rate predictions, per pattern:
/// `1 − |realised − predicted| / predicted` over the trades that carried a
/// prediction. Patterns without predictions are omitted.
fn kelly_accuracy(closed: &[&Trade]) -> BTreeMap<String, f64> {
    let mut groups: BTreeMap<String, Vec<&Trade>> = BTreeMap::new();
    for trade in closed {
        if trade.predicted_win_rate.is_some() {
            groups
                .entry(trade.pattern_tag.clone())
                .or_default()
                .push(trade);
        }
    }

    let mut out = BTreeMap::new();
    for (pattern, group) in groups {
        let predicted = group
            .iter()
            .filter_map(|t| t.predicted_win_rate)
            .sum::<f64>()
            / group.len() as f64;
        if predicted <= 0.0 {
            continue;
        }
        let winners = group
            .iter()
            .filter(|t| t.realized_pnl.is_some_and(|p| p > Decimal::ZERO))
            .count();
        let realized = winners as f64 / group.len() as f64;
        out.insert(pattern, 1.0 - (realized - predicted).abs() / predicted);
    }
    out
}

fn sample_std(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let variance =
        data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Root mean square of the negative returns, over the full series length.
fn downside_deviation(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let sum_sq = returns
        .iter()
        .map(|r| {
            let d = r.min(0.0);
            d * d
        })
        .sum::<f64>();
    (sum_sq / returns.len() as f64).sqrt()
}
