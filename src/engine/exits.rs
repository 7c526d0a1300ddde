use rust_decimal::Decimal;

use super::types::{ExitReason, Position};
use crate::data::Snapshot;

/// Evaluate the automatic exit rules for one position against one daily bar.
///
/// Priority: stop loss first, then profit target. A bar whose range spans
/// both levels resolves to the stop, the conservative assumption that the
/// stop was hit first intraday. Gap handling: a gap through the level fills
/// at the open, never at a price the market skipped.
pub fn evaluate_bar(position: &Position, bar: &Snapshot) -> Option<(Decimal, ExitReason)> {
    if bar.low <= position.stop_loss_price {
        let fill = bar.open.min(position.stop_loss_price);
        return Some((fill, ExitReason::StopLoss));
    }
    if bar.high >= position.profit_target_price {
        let fill = bar.open.max(position.profit_target_price);
        return Some((fill, ExitReason::ProfitTarget));
    }
    None
}
