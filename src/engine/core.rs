use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use super::costs::CostModel;
use super::metrics;
use super::portfolio::{PortfolioSimulator, RiskParams, SignalMeta};
use super::types::{BacktestResult, BuyOutcome, EquityPoint, ExitReason};
use crate::config::BacktestConfig;
use crate::data::{DataProvider, UniverseFilter};
use crate::error::BacktestError;
use crate::strategies::{self, Strategy};

/// Cooperative cancellation flag, checked at the top of each trading-day
/// iteration. On cancel the partial result is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Run a backtest with the strategy named by the config.
pub fn run_backtest(
    config: &BacktestConfig,
    provider: &dyn DataProvider,
    cancel: Option<&CancelToken>,
) -> Result<BacktestResult, BacktestError> {
    config.check()?;
    let mut strategy = strategies::build_strategy(&config.strategy_id, &config.strategy_params)?;
    run_with_strategy(config, provider, strategy.as_mut(), cancel)
}

/// The driving loop: one iteration per trading day, strictly ordered:
/// mark-to-market, automatic exits, strategy sells, strategy buys, equity
/// sample. Exits always precede entries on the same day, and within each
/// phase iteration order is deterministic, so two runs with identical
/// config and provider data produce identical trade logs and equity curves.
pub fn run_with_strategy(
    config: &BacktestConfig,
    provider: &dyn DataProvider,
    strategy: &mut dyn Strategy,
    cancel: Option<&CancelToken>,
) -> Result<BacktestResult, BacktestError> {
    config.check()?;
    let started = Instant::now();
    let region = config.region();

    let days = provider.trading_days(region, config.start_date, config.end_date);
    tracing::info!(
        %region,
        start = %config.start_date,
        end = %config.end_date,
        trading_days = days.len(),
        strategy = strategy.id(),
        "starting backtest"
    );

    let costs = CostModel::from_config(config);
    let kelly = Decimal::from_f64(config.kelly_multiplier).unwrap_or(Decimal::ONE);
    let universe_filter = config.tickers.as_ref().map(|tickers| UniverseFilter {
        tickers: Some(tickers.clone()),
        ..UniverseFilter::default()
    });

    let mut portfolio = PortfolioSimulator::new(
        config.initial_capital,
        RiskParams::from_config(config),
    );
    let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(days.len());
    let mut prev_total = config.initial_capital;

    let last_day = days.last().copied();
    for &day in &days {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            tracing::info!(%day, "run cancelled");
            return Err(BacktestError::Cancelled);
        }

        // Phase 1: revalue the book at today's closes.
        portfolio.mark_to_market(day, provider);

        // Phase 2: stop-loss / profit-target exits.
        for intent in portfolio.check_exits(day, provider) {
            portfolio.apply_sell(
                &intent.ticker,
                intent.region,
                intent.price,
                intent.reason,
                day,
                &costs,
            )?;
        }

        // Phase 3: strategy-level sells, at today's close.
        let open = portfolio.open_positions_sorted();
        if !open.is_empty() {
            for intent in strategy.decide_sells(&open, day, provider) {
                if !portfolio.has_position(&intent.ticker, intent.region) {
                    tracing::warn!(
                        ticker = %intent.ticker,
                        "strategy sell for a position that is not open; skipped"
                    );
                    continue;
                }
                let Some(snap) = provider.snapshot(&intent.ticker, intent.region, day) else {
                    tracing::debug!(ticker = %intent.ticker, %day, "no bar for strategy sell");
                    continue;
                };
                portfolio.apply_sell(
                    &intent.ticker,
                    intent.region,
                    snap.close,
                    ExitReason::StrategySell,
                    day,
                    &costs,
                )?;
            }
        }

        // Phase 4: entries, in rank order, until capacity is exhausted.
        let universe = provider.universe(region, day, universe_filter.as_ref());
        if !universe.is_empty() {
            let view = portfolio.view();
            let candidates = strategy.rank_buys(&universe, region, day, provider, &view);
            for candidate in candidates {
                if candidate.region != region {
                    tracing::debug!(
                        ticker = %candidate.ticker,
                        candidate_region = %candidate.region,
                        "candidate outside the run region; skipped"
                    );
                    continue;
                }
                let meta = SignalMeta {
                    pattern_tag: candidate.pattern_tag.clone(),
                    entry_score: candidate.entry_score,
                    predicted_win_rate: candidate.predicted_win_rate,
                };
                let notional = candidate.intended_notional * kelly;
                let outcome = portfolio.attempt_buy(
                    &candidate.ticker,
                    region,
                    notional,
                    &meta,
                    day,
                    provider,
                    &costs,
                );
                match outcome {
                    BuyOutcome::Filled { shares, fill_price } => {
                        tracing::debug!(
                            ticker = %candidate.ticker,
                            %day,
                            shares,
                            %fill_price,
                            pattern = %candidate.pattern_tag,
                            "filled"
                        );
                    }
                    BuyOutcome::CashReserveBreach => {
                        tracing::debug!(%day, "cash reserve exhausted; entry phase over");
                        break;
                    }
                    rejected => {
                        tracing::debug!(
                            ticker = %candidate.ticker,
                            %day,
                            outcome = rejected.label(),
                            "buy rejected"
                        );
                    }
                }
            }
        }

        // Termination: close everything at the final close so every trade
        // ends closed and the metrics are well-defined.
        if Some(day) == last_day {
            portfolio.liquidate_all(day, &costs)?;
        }

        // Phase 5: sample the equity curve after all fills.
        let total = portfolio.total_value();
        let daily_return = if prev_total > Decimal::ZERO {
            ((total - prev_total) / prev_total).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        equity_curve.push(EquityPoint {
            date: day,
            cash: portfolio.cash(),
            positions_value: portfolio.positions_value(),
            total_value: total,
            daily_return,
        });
        prev_total = total;
    }

    let trades = portfolio.into_trade_log();
    let run_metrics = metrics::compute(
        &equity_curve,
        &trades,
        config.initial_capital,
        config.risk_free_rate,
    );
    let execution_time = started.elapsed();
    tracing::info!(
        trades = trades.len(),
        final_value = %equity_curve
            .last()
            .map_or(config.initial_capital, |p| p.total_value),
        elapsed_ms = execution_time.as_millis(),
        "backtest finished"
    );

    Ok(BacktestResult {
        config: config.clone(),
        metrics: run_metrics,
        trades,
        equity_curve,
        start_date: config.start_date,
        end_date: config.end_date,
        execution_time,
    })
}
