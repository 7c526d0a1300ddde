use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use super::costs::CostModel;
use super::exits;
use super::types::{
    BuyOutcome, ExitIntent, ExitReason, PortfolioView, Position, PositionKey, Side, Trade,
};
use crate::config::BacktestConfig;
use crate::data::{DataProvider, Region};
use crate::error::BacktestError;

/// Sector bucket for tickers without a classification.
const UNCLASSIFIED_SECTOR: &str = "unclassified";

/// Risk parameters lifted out of the config into fixed-point form once,
/// so limit checks stay exact.
#[derive(Debug, Clone)]
pub struct RiskParams {
    pub max_position_fraction: Decimal,
    pub max_sector_fraction: Decimal,
    pub min_cash_fraction: Decimal,
    pub stop_loss_atr_multiplier: Decimal,
    pub stop_loss_min: Decimal,
    pub stop_loss_max: Decimal,
    pub profit_target: Decimal,
}

impl RiskParams {
    pub fn from_config(config: &BacktestConfig) -> Self {
        let dec = |v: f64| Decimal::from_f64(v).unwrap_or_default();
        Self {
            max_position_fraction: dec(config.max_position_fraction),
            max_sector_fraction: dec(config.max_sector_fraction),
            min_cash_fraction: dec(config.min_cash_fraction),
            stop_loss_atr_multiplier: dec(config.stop_loss_atr_multiplier),
            stop_loss_min: dec(config.stop_loss_min),
            stop_loss_max: dec(config.stop_loss_max),
            profit_target: dec(config.profit_target),
        }
    }
}

/// Strategy-supplied context recorded on the position at entry.
#[derive(Debug, Clone)]
pub struct SignalMeta {
    pub pattern_tag: String,
    pub entry_score: f64,
    pub predicted_win_rate: Option<f64>,
}

/// Owns cash, the open-position book, and the append-only trade log.
/// All portfolio mutations flow through here.
pub struct PortfolioSimulator {
    cash: Decimal,
    open_positions: BTreeMap<PositionKey, Position>,
    /// Index of each open position's trade in `trade_log`.
    open_trade_idx: BTreeMap<PositionKey, usize>,
    sector_exposure: BTreeMap<String, Decimal>,
    trade_log: Vec<Trade>,
    positions_value: Decimal,
    risk: RiskParams,
}

impl PortfolioSimulator {
    pub fn new(initial_capital: Decimal, risk: RiskParams) -> Self {
        Self {
            cash: initial_capital,
            open_positions: BTreeMap::new(),
            open_trade_idx: BTreeMap::new(),
            sector_exposure: BTreeMap::new(),
            trade_log: Vec::new(),
            positions_value: Decimal::ZERO,
            risk,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn positions_value(&self) -> Decimal {
        self.positions_value
    }

    /// Cash plus every position at its latest close.
    pub fn total_value(&self) -> Decimal {
        self.cash + self.positions_value
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn has_position(&self, ticker: &str, region: Region) -> bool {
        self.open_positions
            .contains_key(&(ticker.to_string(), region))
    }

    /// Open positions in deterministic (ticker, region) order.
    pub fn open_positions_sorted(&self) -> Vec<Position> {
        self.open_positions.values().cloned().collect()
    }

    pub fn view(&self) -> PortfolioView {
        PortfolioView {
            cash: self.cash,
            positions_value: self.positions_value,
            total_value: self.total_value(),
            open_keys: self.open_positions.keys().cloned().collect(),
        }
    }

    pub fn trade_log(&self) -> &[Trade] {
        &self.trade_log
    }

    pub fn into_trade_log(self) -> Vec<Trade> {
        self.trade_log
    }

    /// Try to open a position. Every rejection is normal control flow; the
    /// engine logs it and moves to the next ranked candidate.
    #[allow(clippy::too_many_arguments)]
    pub fn attempt_buy(
        &mut self,
        ticker: &str,
        region: Region,
        intended_notional: Decimal,
        meta: &SignalMeta,
        date: NaiveDate,
        provider: &dyn DataProvider,
        costs: &CostModel,
    ) -> BuyOutcome {
        let key = (ticker.to_string(), region);
        if self.open_positions.contains_key(&key) {
            return BuyOutcome::DuplicatePosition;
        }

        let Some(snap) = provider.snapshot(ticker, region, date) else {
            return BuyOutcome::NoSnapshot;
        };

        let fill = costs.round_to_tick(snap.close, region, Side::Buy);
        if fill <= Decimal::ZERO || intended_notional <= Decimal::ZERO {
            return BuyOutcome::BelowMinLot;
        }
        let adv = snap.avg_volume_20;

        // Slippage depends on order size, which depends on slippage. First
        // size the order at the bare fill price, then re-size against the
        // all-in per-share cost.
        let Some(estimate) = (intended_notional / fill).floor().to_u64() else {
            return BuyOutcome::BelowMinLot;
        };
        if estimate == 0 {
            return BuyOutcome::BelowMinLot;
        }
        let slip_per_share = costs.slippage_per_share(fill, estimate, adv);
        let Some(shares) = (intended_notional / (fill + slip_per_share))
            .floor()
            .to_u64()
        else {
            return BuyOutcome::BelowMinLot;
        };
        if shares == 0 {
            return BuyOutcome::BelowMinLot;
        }

        let slippage = slip_per_share * Decimal::from(shares);
        let commission = costs.commission(fill, shares, region);
        let notional = fill * Decimal::from(shares);
        let total_cost = notional + commission + slippage;

        let portfolio_value = self.total_value();
        if self.cash - total_cost < self.risk.min_cash_fraction * portfolio_value {
            return BuyOutcome::CashReserveBreach;
        }
        if notional > self.risk.max_position_fraction * portfolio_value {
            return BuyOutcome::PositionLimit;
        }

        let sector_tag = provider
            .metadata(ticker, region)
            .and_then(|m| m.sector)
            .unwrap_or_else(|| UNCLASSIFIED_SECTOR.to_string());
        let sector_now = self
            .sector_exposure
            .get(&sector_tag)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if sector_now + notional > self.risk.max_sector_fraction * portfolio_value {
            return BuyOutcome::SectorLimit;
        }

        let (stop, target) = self.exit_levels(fill, snap.atr_14, region, costs);

        self.cash -= total_cost;
        let position = Position {
            ticker: ticker.to_string(),
            region,
            entry_date: date,
            entry_price: fill,
            shares,
            stop_loss_price: stop,
            profit_target_price: target,
            pattern_tag: meta.pattern_tag.clone(),
            entry_score: meta.entry_score,
            predicted_win_rate: meta.predicted_win_rate,
            sector_tag: sector_tag.clone(),
            last_close: snap.close,
            last_avg_volume: adv,
        };
        let market_value = position.market_value();
        self.positions_value += market_value;
        *self
            .sector_exposure
            .entry(sector_tag)
            .or_insert(Decimal::ZERO) += market_value;

        let trade = Trade::open_from(&position, commission, slippage);
        self.open_trade_idx.insert(key.clone(), self.trade_log.len());
        self.trade_log.push(trade);
        self.open_positions.insert(key, position);

        debug_assert!(self.verify_invariants().is_ok());
        BuyOutcome::Filled {
            shares,
            fill_price: fill,
        }
    }

    /// Stop and target construction: the stop distance is
    /// `ATR × multiplier` relative to entry, clamped to the configured
    /// bounds; without an ATR the tightest bound applies. Both levels are
    /// tick-aligned away from entry so the position invariant
    /// `stop < entry < target` always holds.
    fn exit_levels(
        &self,
        entry: Decimal,
        atr: Option<Decimal>,
        region: Region,
        costs: &CostModel,
    ) -> (Decimal, Decimal) {
        let relative = atr
            .map(|a| (a * self.risk.stop_loss_atr_multiplier) / entry)
            .unwrap_or(self.risk.stop_loss_min)
            .clamp(self.risk.stop_loss_min, self.risk.stop_loss_max);

        let stop_raw = entry * (Decimal::ONE - relative);
        let stop = costs
            .round_to_tick(stop_raw, region, Side::Sell)
            .min(costs.tick_below(entry, region));

        let target_raw = entry * (Decimal::ONE + self.risk.profit_target);
        let target = costs
            .round_to_tick(target_raw, region, Side::Buy)
            .max(costs.tick_above(entry, region));

        (stop, target)
    }

    /// Recompute every open position's valuation at the day's close and
    /// refresh the derived caches. Positions without a row that day (halts)
    /// carry their previous close.
    pub fn mark_to_market(&mut self, date: NaiveDate, provider: &dyn DataProvider) {
        let mut positions_value = Decimal::ZERO;
        let mut sector_exposure: BTreeMap<String, Decimal> = BTreeMap::new();
        for position in self.open_positions.values_mut() {
            if let Some(snap) = provider.snapshot(&position.ticker, position.region, date) {
                position.last_close = snap.close;
                position.last_avg_volume = snap.avg_volume_20;
            }
            let value = position.market_value();
            positions_value += value;
            *sector_exposure
                .entry(position.sector_tag.clone())
                .or_insert(Decimal::ZERO) += value;
        }
        self.positions_value = positions_value;
        self.sector_exposure = sector_exposure;
    }

    /// Evaluate the automatic exit rules for every open position, in
    /// deterministic (ticker, region) order. Stop beats target on the same
    /// bar; positions without a bar that day stay open.
    pub fn check_exits(&self, date: NaiveDate, provider: &dyn DataProvider) -> Vec<ExitIntent> {
        let mut intents = Vec::new();
        for ((ticker, region), position) in &self.open_positions {
            let Some(snap) = provider.snapshot(ticker, *region, date) else {
                continue;
            };
            if let Some((price, reason)) = exits::evaluate_bar(position, &snap) {
                intents.push(ExitIntent {
                    ticker: ticker.clone(),
                    region: *region,
                    price,
                    reason,
                });
            }
        }
        intents
    }

    /// Close the full position at the given raw price: tick-round down,
    /// charge commission and slippage, realise P&L, credit cash, finalise
    /// the trade. Selling without an open position is a core bug.
    pub fn apply_sell(
        &mut self,
        ticker: &str,
        region: Region,
        raw_price: Decimal,
        reason: ExitReason,
        date: NaiveDate,
        costs: &CostModel,
    ) -> Result<(), BacktestError> {
        let key = (ticker.to_string(), region);
        let Some(position) = self.open_positions.remove(&key) else {
            return Err(BacktestError::Invariant(format!(
                "sell of {ticker} ({region}) with no open position"
            )));
        };
        let Some(trade_idx) = self.open_trade_idx.remove(&key) else {
            return Err(BacktestError::Invariant(format!(
                "open position {ticker} ({region}) has no open trade"
            )));
        };

        let fill = costs.round_to_tick(raw_price, region, Side::Sell);
        let shares_dec = Decimal::from(position.shares);
        let slippage = costs.slippage(fill, position.shares, position.last_avg_volume);
        let commission = costs.commission(fill, position.shares, region);
        let proceeds = fill * shares_dec - commission - slippage;
        self.cash += proceeds;

        let market_value = position.market_value();
        self.positions_value -= market_value;
        if let Some(exposure) = self.sector_exposure.get_mut(&position.sector_tag) {
            *exposure -= market_value;
            if *exposure <= Decimal::ZERO {
                self.sector_exposure.remove(&position.sector_tag);
            }
        }

        let trade = self
            .trade_log
            .get_mut(trade_idx)
            .ok_or_else(|| BacktestError::Invariant("trade index out of bounds".to_string()))?;
        if trade.is_closed() {
            return Err(BacktestError::Invariant(format!(
                "trade for {ticker} ({region}) already closed"
            )));
        }
        trade.commission_paid += commission;
        trade.slippage_paid += slippage;
        let pnl =
            (fill - trade.entry_price) * shares_dec - trade.commission_paid - trade.slippage_paid;
        let entry_notional = trade.entry_price * shares_dec;
        trade.exit_date = Some(date);
        trade.exit_price = Some(fill);
        trade.realized_pnl = Some(pnl);
        trade.realized_return = Some(if entry_notional > Decimal::ZERO {
            (pnl / entry_notional).to_f64().unwrap_or(0.0)
        } else {
            0.0
        });
        trade.exit_reason = Some(reason);

        tracing::debug!(
            %ticker,
            %region,
            %fill,
            reason = reason.as_str(),
            %pnl,
            "closed position"
        );

        self.verify_invariants()
    }

    /// Close every remaining position at its latest close. Used by the
    /// engine at the end of the run so all trades finish closed.
    pub fn liquidate_all(
        &mut self,
        date: NaiveDate,
        costs: &CostModel,
    ) -> Result<(), BacktestError> {
        let remaining: Vec<(PositionKey, Decimal)> = self
            .open_positions
            .iter()
            .map(|(key, p)| (key.clone(), p.last_close))
            .collect();
        for ((ticker, region), price) in remaining {
            self.apply_sell(
                &ticker,
                region,
                price,
                ExitReason::EndOfBacktest,
                date,
                costs,
            )?;
        }
        Ok(())
    }

    /// Book-consistency checks, run after every mutation. A failure is a
    /// core bug: fail fast, never mask.
    pub fn verify_invariants(&self) -> Result<(), BacktestError> {
        if self.cash < Decimal::ZERO {
            tracing::error!(cash = %self.cash, "negative cash balance");
            return Err(BacktestError::Invariant(format!(
                "negative cash balance: {}",
                self.cash
            )));
        }
        let open_trades = self.trade_log.iter().filter(|t| t.is_open()).count();
        if open_trades != self.open_positions.len() {
            return Err(BacktestError::Invariant(format!(
                "{} open trades vs {} open positions",
                open_trades,
                self.open_positions.len()
            )));
        }
        for (key, idx) in &self.open_trade_idx {
            let Some(trade) = self.trade_log.get(*idx) else {
                return Err(BacktestError::Invariant(format!(
                    "trade index {idx} out of bounds for {}",
                    key.0
                )));
            };
            if trade.is_closed() || trade.ticker != key.0 || trade.region != key.1 {
                return Err(BacktestError::Invariant(format!(
                    "open-trade index mismatch for {} ({})",
                    key.0, key.1
                )));
            }
        }
        for position in self.open_positions.values() {
            if position.shares == 0
                || position.entry_price <= Decimal::ZERO
                || position.stop_loss_price >= position.entry_price
                || position.profit_target_price <= position.entry_price
            {
                return Err(BacktestError::Invariant(format!(
                    "malformed position for {} ({})",
                    position.ticker, position.region
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, MemoryProvider, TickerMeta};
    use rust_decimal_macros::dec;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i64::from(day) - 1)
    }

    fn flat_bars(days: u32, price: Decimal) -> Vec<Bar> {
        (1..=days)
            .map(|d| Bar {
                date: date(d),
                open: price,
                high: price + dec!(2),
                low: price - dec!(2),
                close: price,
                volume: 100_000,
            })
            .collect()
    }

    fn risk() -> RiskParams {
        RiskParams {
            max_position_fraction: dec!(0.2),
            max_sector_fraction: dec!(0.4),
            min_cash_fraction: dec!(0.1),
            stop_loss_atr_multiplier: dec!(2),
            stop_loss_min: dec!(0.03),
            stop_loss_max: dec!(0.15),
            profit_target: dec!(0.2),
        }
    }

    fn meta() -> SignalMeta {
        SignalMeta {
            pattern_tag: "Stage2".to_string(),
            entry_score: 1.0,
            predicted_win_rate: None,
        }
    }

    fn frictionless() -> CostModel {
        CostModel::new(Some(dec!(0)), None, 0.0)
    }

    fn provider_one_ticker() -> MemoryProvider {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, flat_bars(30, dec!(100)))
            .unwrap();
        provider
    }

    #[test]
    fn buy_fills_and_deducts_cash() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let outcome = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        assert_eq!(
            outcome,
            BuyOutcome::Filled {
                shares: 2000,
                fill_price: dec!(100)
            }
        );
        assert_eq!(portfolio.cash(), dec!(800000));
        assert_eq!(portfolio.positions_value(), dec!(200000));
        assert_eq!(portfolio.total_value(), dec!(1000000));
        assert_eq!(portfolio.trade_log().len(), 1);
        assert!(portfolio.trade_log()[0].is_open());
    }

    #[test]
    fn duplicate_position_rejected() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let costs = frictionless();
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        let second = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(21),
            &provider,
            &costs,
        );
        assert_eq!(second, BuyOutcome::DuplicatePosition);
        assert_eq!(portfolio.trade_log().len(), 1);
    }

    #[test]
    fn no_snapshot_rejected() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        // Day 40 is past the data span.
        let outcome = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(40),
            &provider,
            &frictionless(),
        );
        assert_eq!(outcome, BuyOutcome::NoSnapshot);
    }

    #[test]
    fn below_min_lot_rejected() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let outcome = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(50),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        assert_eq!(outcome, BuyOutcome::BelowMinLot);
        assert_eq!(portfolio.cash(), dec!(1000000));
    }

    #[test]
    fn position_limit_rejected_cash_untouched() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        // 250,000 > 20% of 1,000,000
        let outcome = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(250000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        assert_eq!(outcome, BuyOutcome::PositionLimit);
        assert_eq!(portfolio.cash(), dec!(1000000));
        assert!(portfolio.trade_log().is_empty());
    }

    #[test]
    fn cash_reserve_breach_rejected() {
        let mut risk = risk();
        risk.max_position_fraction = dec!(0.95);
        risk.max_sector_fraction = dec!(0.99);
        risk.min_cash_fraction = dec!(0.2);
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk);
        // 850,000 would leave 150,000 cash < 20% reserve.
        let outcome = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(850000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        assert_eq!(outcome, BuyOutcome::CashReserveBreach);
    }

    #[test]
    fn sector_limit_rejected() {
        let mut provider = MemoryProvider::new();
        provider
            .add_ticker("AAA", Region::Kr, flat_bars(30, dec!(100)))
            .unwrap();
        provider
            .add_ticker("BBB", Region::Kr, flat_bars(30, dec!(100)))
            .unwrap();
        for t in ["AAA", "BBB"] {
            provider.set_metadata(
                t,
                Region::Kr,
                TickerMeta {
                    sector: Some("Semis".to_string()),
                    ..TickerMeta::default()
                },
            );
        }
        let mut risk = risk();
        risk.max_sector_fraction = dec!(0.3);
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk);
        let costs = frictionless();
        let first = portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        assert!(matches!(first, BuyOutcome::Filled { .. }));
        // Another 200,000 in the same sector would be 40% > 30% cap.
        let second = portfolio.attempt_buy(
            "BBB",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        assert_eq!(second, BuyOutcome::SectorLimit);
    }

    #[test]
    fn stop_and_target_derive_from_atr() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        let position = &portfolio.open_positions_sorted()[0];
        // Constant bars: ATR = 4, distance = 2 × 4 / 100 = 8%, inside the
        // [3%, 15%] clamp → stop at 92. Target at 120, both on the 1-won grid.
        assert_eq!(position.stop_loss_price, dec!(92));
        assert_eq!(position.profit_target_price, dec!(120));
    }

    #[test]
    fn stop_distance_clamps_to_bounds() {
        let mut provider = MemoryProvider::new();
        // Very wide bars: ATR will exceed the 15% cap.
        let bars: Vec<Bar> = (1..=30)
            .map(|d| Bar {
                date: date(d),
                open: dec!(100),
                high: dec!(120),
                low: dec!(80),
                close: dec!(100),
                volume: 100_000,
            })
            .collect();
        provider.add_ticker("AAA", Region::Kr, bars).unwrap();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        let position = &portfolio.open_positions_sorted()[0];
        assert_eq!(position.stop_loss_price, dec!(85));
    }

    #[test]
    fn sell_realizes_pnl_and_credits_cash() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let costs = frictionless();
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        portfolio
            .apply_sell(
                "AAA",
                Region::Kr,
                dec!(110),
                ExitReason::StrategySell,
                date(25),
                &costs,
            )
            .unwrap();

        assert_eq!(portfolio.open_position_count(), 0);
        assert_eq!(portfolio.cash(), dec!(1020000));
        let trade = &portfolio.trade_log()[0];
        assert!(trade.is_closed());
        assert_eq!(trade.exit_price, Some(dec!(110)));
        assert_eq!(trade.realized_pnl, Some(dec!(20000)));
        assert!((trade.realized_return.unwrap() - 0.10).abs() < 1e-12);
        assert_eq!(trade.exit_reason, Some(ExitReason::StrategySell));
    }

    #[test]
    fn sell_without_position_is_invariant_violation() {
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let err = portfolio
            .apply_sell(
                "AAA",
                Region::Kr,
                dec!(100),
                ExitReason::Manual,
                date(5),
                &frictionless(),
            )
            .unwrap_err();
        assert!(matches!(err, BacktestError::Invariant(_)));
    }

    #[test]
    fn costs_are_charged_on_both_legs() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        // 0.1% commission each way, no slippage.
        let costs = CostModel::new(Some(dec!(0.001)), None, 0.0);
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(100000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        portfolio
            .apply_sell(
                "AAA",
                Region::Kr,
                dec!(100),
                ExitReason::Manual,
                date(25),
                &costs,
            )
            .unwrap();
        let trade = &portfolio.trade_log()[0];
        // 1,000 shares at 100: commission 100 each way.
        assert_eq!(trade.shares, 1000);
        assert_eq!(trade.commission_paid, dec!(200));
        // Flat price round trip loses exactly the commissions.
        assert_eq!(trade.realized_pnl, Some(dec!(-200)));
    }

    #[test]
    fn check_exits_orders_by_ticker() {
        let mut provider = MemoryProvider::new();
        // Both gap far below their stops on day 25.
        for t in ["BBB", "AAA"] {
            let mut bars = flat_bars(24, dec!(100));
            bars.push(Bar {
                date: date(25),
                open: dec!(60),
                high: dec!(61),
                low: dec!(59),
                close: dec!(60),
                volume: 100_000,
            });
            provider.add_ticker(t, Region::Kr, bars).unwrap();
        }
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let costs = frictionless();
        for t in ["BBB", "AAA"] {
            let outcome = portfolio.attempt_buy(
                t,
                Region::Kr,
                dec!(100000),
                &meta(),
                date(20),
                &provider,
                &costs,
            );
            assert!(matches!(outcome, BuyOutcome::Filled { .. }));
        }
        let intents = portfolio.check_exits(date(25), &provider);
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].ticker, "AAA");
        assert_eq!(intents[1].ticker, "BBB");
        assert!(intents.iter().all(|i| i.reason == ExitReason::StopLoss));
    }

    #[test]
    fn mark_to_market_revalues_positions() {
        let mut provider = MemoryProvider::new();
        let mut bars = flat_bars(24, dec!(100));
        bars.push(Bar {
            date: date(25),
            open: dec!(104),
            high: dec!(106),
            low: dec!(103),
            close: dec!(105),
            volume: 100_000,
        });
        provider.add_ticker("AAA", Region::Kr, bars).unwrap();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &frictionless(),
        );
        portfolio.mark_to_market(date(25), &provider);
        assert_eq!(portfolio.positions_value(), dec!(210000));
        assert_eq!(portfolio.total_value(), dec!(1010000));
    }

    #[test]
    fn liquidate_all_closes_everything() {
        let provider = provider_one_ticker();
        let mut portfolio = PortfolioSimulator::new(dec!(1000000), risk());
        let costs = frictionless();
        portfolio.attempt_buy(
            "AAA",
            Region::Kr,
            dec!(200000),
            &meta(),
            date(20),
            &provider,
            &costs,
        );
        portfolio.mark_to_market(date(25), &provider);
        portfolio.liquidate_all(date(25), &costs).unwrap();
        assert_eq!(portfolio.open_position_count(), 0);
        let trade = &portfolio.trade_log()[0];
        assert_eq!(trade.exit_reason, Some(ExitReason::EndOfBacktest));
        assert_eq!(portfolio.total_value(), dec!(1000000));
    }
}
