pub mod backtest;
pub mod execution;
pub mod result;
pub mod sweep;

pub use backtest::{BacktestConfig, BacktestEngine, CancelToken, GapPolicy, SimulationBackend};
pub use execution::{
    CommissionConfig, CostModel, ExecutionModel, Fill, FillTiming, Order, OrderKind, OrderSide,
    SlippageConfig,
};
pub use result::{AbortKind, AbortReason, Annotation, BacktestResult, RunState, TradeRow};
pub use sweep::{run_sweep, SweepJob, SweepOutcome};
