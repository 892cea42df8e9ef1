pub mod backtest_config;

pub use backtest_config::{
    DataSourceConfig, RunConfiguration, SourceKind, StrategyParams, StrategyType,
};
