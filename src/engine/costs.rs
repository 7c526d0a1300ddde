use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::Side;
use crate::config::BacktestConfig;
use crate::data::Region;

/// Decimal places kept on computed cost amounts. Keeps repeated runs
/// bit-identical regardless of intermediate scale.
const COST_DP: u32 = 6;

/// Per-region commission rate on gross notional. The table is data; adding
/// a region is a configuration change, not a code change.
fn commission_rate(region: Region) -> Decimal {
    match region {
        Region::Kr => dec!(0.00015), // 0.015%
        Region::Us => Decimal::ZERO,
        Region::Cn => dec!(0.00025),
        Region::Hk => dec!(0.00025),
        Region::Jp => dec!(0.0003), // 0.03%
        Region::Vn => dec!(0.001),
    }
}

/// Price-banded tick size: `(exclusive upper price bound, tick)`, with a
/// final catch-all tick above the last bound.
fn tick_size(region: Region, price: Decimal) -> Decimal {
    let (bands, catch_all): (&[(Decimal, Decimal)], Decimal) = match region {
        Region::Kr => (
            &[
                (dec!(2000), dec!(1)),
                (dec!(5000), dec!(5)),
                (dec!(20000), dec!(10)),
                (dec!(50000), dec!(50)),
                (dec!(200000), dec!(100)),
                (dec!(500000), dec!(500)),
            ],
            dec!(1000),
        ),
        Region::Us | Region::Cn => (&[], dec!(0.01)),
        Region::Hk => (
            &[
                (dec!(0.25), dec!(0.001)),
                (dec!(0.50), dec!(0.005)),
                (dec!(10), dec!(0.01)),
                (dec!(20), dec!(0.02)),
                (dec!(100), dec!(0.05)),
                (dec!(200), dec!(0.10)),
                (dec!(500), dec!(0.20)),
                (dec!(1000), dec!(0.50)),
                (dec!(2000), dec!(1)),
            ],
            dec!(2),
        ),
        Region::Jp => (
            &[
                (dec!(3000), dec!(1)),
                (dec!(5000), dec!(5)),
                (dec!(30000), dec!(10)),
                (dec!(50000), dec!(50)),
                (dec!(300000), dec!(100)),
            ],
            dec!(500),
        ),
        Region::Vn => (
            &[(dec!(10000), dec!(10)), (dec!(50000), dec!(50))],
            dec!(100),
        ),
    };

    for (bound, tick) in bands {
        if price < *bound {
            return *tick;
        }
    }
    catch_all
}

/// Deterministic commission / slippage / tick-rounding model. Given
/// identical inputs, outputs are bit-identical across runs.
#[derive(Debug, Clone)]
pub struct CostModel {
    /// Replaces the region table rate when set.
    commission_override: Option<Decimal>,
    /// Commission floor per fill, when configured.
    commission_min: Option<Decimal>,
    base_slippage_bps: f64,
}

impl CostModel {
    pub fn new(
        commission_override: Option<Decimal>,
        commission_min: Option<Decimal>,
        base_slippage_bps: f64,
    ) -> Self {
        Self {
            commission_override,
            commission_min,
            base_slippage_bps,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Self {
        Self::new(
            config.commission_rate.and_then(Decimal::from_f64),
            config.commission_min,
            config.base_slippage_bps,
        )
    }

    /// Commission on a fill: rate × gross notional, floored at the
    /// configured minimum.
    pub fn commission(&self, price: Decimal, shares: u64, region: Region) -> Decimal {
        let rate = self
            .commission_override
            .unwrap_or_else(|| commission_rate(region));
        let fee = (price * Decimal::from(shares) * rate).round_dp(COST_DP);
        match self.commission_min {
            Some(min) if fee < min => min,
            _ => fee,
        }
    }

    /// Market-impact slippage per share:
    /// `bps = base_bps × sqrt(order_size / adv)`, so cost grows with the
    /// order's share of typical liquidity. Buys pay it on top of the fill,
    /// sells give it up from the proceeds. With no volume history the full
    /// base impact is charged.
    pub fn slippage_per_share(
        &self,
        price: Decimal,
        shares: u64,
        avg_daily_volume: Option<u64>,
    ) -> Decimal {
        if shares == 0 {
            return Decimal::ZERO;
        }
        let ratio = match avg_daily_volume {
            Some(adv) if adv > 0 => shares as f64 / adv as f64,
            _ => 1.0,
        };
        let bps = self.base_slippage_bps * ratio.sqrt();
        let factor = Decimal::from_f64(bps / 10_000.0).unwrap_or_default();
        (price * factor).round_dp(COST_DP)
    }

    /// Total slippage amount for an order.
    pub fn slippage(&self, price: Decimal, shares: u64, avg_daily_volume: Option<u64>) -> Decimal {
        self.slippage_per_share(price, shares, avg_daily_volume) * Decimal::from(shares)
    }

    /// Round a price to the region's tick grid. Buys round up and sells
    /// round down, so realised costs are conservative.
    pub fn round_to_tick(&self, price: Decimal, region: Region, side: Side) -> Decimal {
        let tick = tick_size(region, price);
        let steps = price / tick;
        let steps = match side {
            Side::Buy => steps.ceil(),
            Side::Sell => steps.floor(),
        };
        steps * tick
    }

    /// Largest grid price strictly below `price`.
    pub fn tick_below(&self, price: Decimal, region: Region) -> Decimal {
        let tick = tick_size(region, price);
        let floored = (price / tick).floor() * tick;
        if floored < price {
            floored
        } else {
            floored - tick
        }
    }

    /// Smallest grid price strictly above `price`.
    pub fn tick_above(&self, price: Decimal, region: Region) -> Decimal {
        let tick = tick_size(region, price);
        let ceiled = (price / tick).ceil() * tick;
        if ceiled > price {
            ceiled
        } else {
            ceiled + tick
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> CostModel {
        CostModel::new(None, None, 10.0)
    }

    #[test]
    fn commission_uses_region_table() {
        // KR: 0.015% of 70,000 × 100 = 1,050
        let fee = model().commission(dec!(70000), 100, Region::Kr);
        assert_eq!(fee, dec!(1050));
        // US equities are commission-free in the table.
        assert_eq!(model().commission(dec!(150), 100, Region::Us), dec!(0));
    }

    #[test]
    fn commission_override_replaces_table() {
        let m = CostModel::new(Some(dec!(0.001)), None, 10.0);
        assert_eq!(m.commission(dec!(100), 10, Region::Us), dec!(1));
    }

    #[test]
    fn commission_floor_applies() {
        let m = CostModel::new(Some(dec!(0.0001)), Some(dec!(5)), 10.0);
        // 100 × 10 × 0.0001 = 0.1 < 5 → floored
        assert_eq!(m.commission(dec!(100), 10, Region::Us), dec!(5));
        // Large order clears the floor
        assert_eq!(m.commission(dec!(100), 10_000, Region::Us), dec!(100));
    }

    #[test]
    fn slippage_full_adv_charges_base_bps() {
        // order == adv → sqrt(1) → 10 bps of 100 = 0.1 per share
        let per_share = model().slippage_per_share(dec!(100), 1_000, Some(1_000));
        assert_eq!(per_share, dec!(0.1));
        assert_eq!(model().slippage(dec!(100), 1_000, Some(1_000)), dec!(100));
    }

    #[test]
    fn slippage_scales_with_sqrt_of_participation() {
        // order = adv/4 → sqrt(0.25) = 0.5 → 5 bps of 100 = 0.05
        let per_share = model().slippage_per_share(dec!(100), 250, Some(1_000));
        assert_eq!(per_share, dec!(0.05));
    }

    #[test]
    fn slippage_without_volume_history_is_conservative() {
        let with_none = model().slippage_per_share(dec!(100), 500, None);
        let with_zero = model().slippage_per_share(dec!(100), 500, Some(0));
        assert_eq!(with_none, dec!(0.1));
        assert_eq!(with_zero, dec!(0.1));
    }

    #[test]
    fn slippage_zero_when_base_is_zero() {
        let m = CostModel::new(None, None, 0.0);
        assert_eq!(m.slippage(dec!(100), 1_000, Some(1_000)), dec!(0));
    }

    #[test]
    fn tick_rounding_kr_bands() {
        // 12,345 sits in the 10-won band.
        let m = model();
        assert_eq!(m.round_to_tick(dec!(12345), Region::Kr, Side::Buy), dec!(12350));
        assert_eq!(m.round_to_tick(dec!(12345), Region::Kr, Side::Sell), dec!(12340));
        // Already on the grid: unchanged either way.
        assert_eq!(m.round_to_tick(dec!(12350), Region::Kr, Side::Buy), dec!(12350));
        assert_eq!(m.round_to_tick(dec!(12350), Region::Kr, Side::Sell), dec!(12350));
    }

    #[test]
    fn tick_rounding_kr_high_band() {
        let m = model();
        // 620,100 is above 500,000 → 1,000-won ticks.
        assert_eq!(
            m.round_to_tick(dec!(620100), Region::Kr, Side::Buy),
            dec!(621000)
        );
        assert_eq!(
            m.round_to_tick(dec!(620100), Region::Kr, Side::Sell),
            dec!(620000)
        );
    }

    #[test]
    fn tick_rounding_us_penny_grid() {
        let m = model();
        assert_eq!(
            m.round_to_tick(dec!(123.456), Region::Us, Side::Buy),
            dec!(123.46)
        );
        assert_eq!(
            m.round_to_tick(dec!(123.456), Region::Us, Side::Sell),
            dec!(123.45)
        );
    }

    #[test]
    fn tick_rounding_hk_low_price_band() {
        let m = model();
        assert_eq!(
            m.round_to_tick(dec!(0.2468), Region::Hk, Side::Sell),
            dec!(0.246)
        );
    }

    #[test]
    fn tick_neighbors_are_strict() {
        let m = model();
        // On-grid price steps a full tick either way.
        assert_eq!(m.tick_below(dec!(12350), Region::Kr), dec!(12340));
        assert_eq!(m.tick_above(dec!(12350), Region::Kr), dec!(12360));
        // Off-grid price snaps to the nearest grid point on each side.
        assert_eq!(m.tick_below(dec!(12345), Region::Kr), dec!(12340));
        assert_eq!(m.tick_above(dec!(12345), Region::Kr), dec!(12350));
    }

    #[test]
    fn outputs_are_deterministic() {
        let a = model().slippage_per_share(dec!(71428.57), 1_234, Some(987_654));
        let b = model().slippage_per_share(dec!(71428.57), 1_234, Some(987_654));
        assert_eq!(a, b);
    }
}
