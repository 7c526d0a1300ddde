pub mod core;
pub mod costs;
pub mod exits;
pub mod metrics;
pub mod portfolio;
pub mod types;

pub use self::core::{run_backtest, run_with_strategy, CancelToken};
pub use costs::CostModel;
pub use portfolio::{PortfolioSimulator, RiskParams, SignalMeta};
pub use types::{BacktestResult, BuyOutcome, ExitReason, RunMetrics};
