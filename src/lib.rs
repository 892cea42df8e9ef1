//bar data cache and deterministic backtesting engine for crypto spot markets

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod portfolio;
pub mod strategy;

//prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        DataSourceConfig, RunConfiguration, SourceKind, StrategyParams, StrategyType,
    };
    pub use crate::data::{
        Bar, BarSeries, BarStore, CsvAdapter, DataCache, Gap, MemoryStore, RemoteApiAdapter,
        RemoteApiConfig, SeriesKey, SourceAdapter, StoreAdapter, TimeRange, Timeframe,
    };
    pub use crate::engine::{
        run_sweep, Annotation, BacktestConfig, BacktestEngine, BacktestResult, CancelToken,
        CommissionConfig, CostModel, ExecutionModel, Fill, FillTiming, GapPolicy, Order,
        OrderKind, OrderSide, RunState, SimulationBackend, SlippageConfig, SweepJob,
    };
    pub use crate::error::{BacktestError, Result};
    pub use crate::metrics::{calculate_equity_curve, EquityPoint, SummaryMetrics};
    pub use crate::portfolio::{Portfolio, Position};
    pub use crate::strategy::{
        buy_and_hold::BuyAndHoldStrategy, reversal::ReversalStrategy,
        sma_crossover::SmaCrossoverStrategy, Sizing, Strategy, StrategyContext,
    };
}
