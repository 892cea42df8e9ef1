use crate::data::{
    BarStore, CsvAdapter, DataCache, MemoryStore, RemoteApiAdapter, RemoteApiConfig, StoreAdapter,
    Timeframe, TimestampConvention,
};
use crate::engine::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::strategy::{
    buy_and_hold::BuyAndHoldStrategy, reversal::ReversalStrategy,
    sma_crossover::SmaCrossoverStrategy, Sizing, Strategy,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

//strategy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    SmaCrossover,
    Reversal,
    BuyAndHold,
}

impl StrategyType {
    //parse strategy type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sma" | "sma_crossover" | "sma-crossover" => Some(StrategyType::SmaCrossover),
            "reversal" | "bearish_reversal" => Some(StrategyType::Reversal),
            "hold" | "buy_and_hold" | "buy-and-hold" => Some(StrategyType::BuyAndHold),
            _ => None,
        }
    }
}

//strategy-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyParams {
    #[serde(rename_all = "camelCase")]
    SmaCrossover {
        fast_window: usize,
        slow_window: usize,
        #[serde(default)]
        sizing: Sizing,
        #[serde(default)]
        close_at_end: bool,
    },
    #[serde(rename_all = "camelCase")]
    Reversal {
        bear_threshold: usize,
        take_profit_pct: f64,
        stop_loss_pct: f64,
        #[serde(default)]
        sizing: Sizing,
    },
    BuyAndHold {
        #[serde(default)]
        sizing: Sizing,
    },
}

impl StrategyParams {
    //defaults of the given strategy type
    pub fn defaults(strategy_type: StrategyType) -> Self {
        match strategy_type {
            StrategyType::SmaCrossover => StrategyParams::SmaCrossover {
                fast_window: 5,
                slow_window: 20,
                sizing: Sizing::default(),
                close_at_end: false,
            },
            StrategyType::Reversal => StrategyParams::Reversal {
                bear_threshold: 3,
                take_profit_pct: 3.0,
                stop_loss_pct: -2.0,
                sizing: Sizing::default(),
            },
            StrategyType::BuyAndHold => StrategyParams::BuyAndHold {
                sizing: Sizing::CapitalFraction(1.0),
            },
        }
    }

    pub fn strategy_type(&self) -> StrategyType {
        match self {
            StrategyParams::SmaCrossover { .. } => StrategyType::SmaCrossover,
            StrategyParams::Reversal { .. } => StrategyType::Reversal,
            StrategyParams::BuyAndHold { .. } => StrategyType::BuyAndHold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizing = match self {
            StrategyParams::SmaCrossover {
                fast_window,
                slow_window,
                sizing,
                ..
            } => {
                if *fast_window == 0 || fast_window >= slow_window {
                    return Err(BacktestError::Configuration(format!(
                        "sma windows need 0 < fast < slow, got fast={} slow={}",
                        fast_window, slow_window
                    )));
                }
                sizing
            }
            StrategyParams::Reversal {
                bear_threshold,
                take_profit_pct,
                stop_loss_pct,
                sizing,
            } => {
                if *bear_threshold == 0 {
                    return Err(BacktestError::Configuration(
                        "bear threshold must be at least 1".to_string(),
                    ));
                }
                if !(take_profit_pct.is_finite() && *take_profit_pct > 0.0) {
                    return Err(BacktestError::Configuration(format!(
                        "take profit must be a positive percent, got {}",
                        take_profit_pct
                    )));
                }
                if !(stop_loss_pct.is_finite() && *stop_loss_pct < 0.0 && *stop_loss_pct > -100.0) {
                    return Err(BacktestError::Configuration(format!(
                        "stop loss must be a negative percent above -100, got {}",
                        stop_loss_pct
                    )));
                }
                sizing
            }
            StrategyParams::BuyAndHold { sizing } => sizing,
        };

        sizing.validate().map_err(BacktestError::Configuration)
    }

    //builds a fresh strategy instance
    pub fn build(&self) -> Box<dyn Strategy> {
        match *self {
            StrategyParams::SmaCrossover {
                fast_window,
                slow_window,
                sizing,
                close_at_end,
            } => Box::new(
                SmaCrossoverStrategy::new(fast_window, slow_window, sizing)
                    .with_close_at_end(close_at_end),
            ),
            StrategyParams::Reversal {
                bear_threshold,
                take_profit_pct,
                stop_loss_pct,
                sizing,
            } => Box::new(ReversalStrategy::new(
                bear_threshold,
                take_profit_pct,
                stop_loss_pct,
                sizing,
            )),
            StrategyParams::BuyAndHold { sizing } => Box::new(BuyAndHoldStrategy::new(sizing)),
        }
    }

    //short label for reports and sweeps
    pub fn label(&self) -> String {
        match self {
            StrategyParams::SmaCrossover {
                fast_window,
                slow_window,
                ..
            } => format!("sma({},{})", fast_window, slow_window),
            StrategyParams::Reversal {
                bear_threshold,
                take_profit_pct,
                stop_loss_pct,
                ..
            } => format!(
                "reversal({},{},{})",
                bear_threshold, take_profit_pct, stop_loss_pct
            ),
            StrategyParams::BuyAndHold { .. } => "buy-and-hold".to_string(),
        }
    }
}

//where bars come from, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Csv,
    Remote,
    //a second relational database, read through the store adapter
    Database,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSourceConfig {
    //adapters tried in this order; earlier entries win timestamp collisions
    pub priority: Vec<SourceKind>,
    pub exchange_id: String,
    pub csv_dir: PathBuf,
    pub timestamp_convention: TimestampConvention,
    pub remote_base_url: String,
    pub api_key: Option<String>,
    pub fetch_timeout_secs: u64,
    //persisted canonical store; in-memory when absent
    pub sqlite_path: Option<PathBuf>,
    //external database read by the database source
    pub source_db_path: Option<PathBuf>,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        let remote = RemoteApiConfig::default();
        DataSourceConfig {
            priority: vec![SourceKind::Csv],
            exchange_id: remote.exchange_id,
            csv_dir: PathBuf::from("data"),
            timestamp_convention: TimestampConvention::default(),
            remote_base_url: remote.base_url,
            api_key: None,
            fetch_timeout_secs: 30,
            sqlite_path: None,
            source_db_path: None,
        }
    }
}

impl DataSourceConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    async fn open_store(&self) -> Result<Arc<dyn BarStore>> {
        match &self.sqlite_path {
            Some(path) => open_sqlite(path).await,
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }

    //wires the store and the adapters in priority order
    pub async fn build_cache(&self) -> Result<DataCache> {
        let mut cache = DataCache::new(self.open_store().await?, self.fetch_timeout());

        for kind in &self.priority {
            cache = match kind {
                SourceKind::Csv => cache.with_adapter(Arc::new(CsvAdapter::new(
                    self.csv_dir.clone(),
                    self.exchange_id.clone(),
                    self.timestamp_convention,
                ))),
                SourceKind::Remote => {
                    let remote = RemoteApiConfig {
                        exchange_id: self.exchange_id.clone(),
                        base_url: self.remote_base_url.clone(),
                        api_key: self.api_key.clone(),
                        request_timeout_secs: self.fetch_timeout_secs,
                        ..RemoteApiConfig::default()
                    };
                    cache.with_adapter(Arc::new(RemoteApiAdapter::new(remote)?))
                }
                SourceKind::Database => {
                    let path = self.source_db_path.as_ref().ok_or_else(|| {
                        BacktestError::Configuration(
                            "database source needs sourceDbPath".to_string(),
                        )
                    })?;
                    cache.with_adapter(Arc::new(StoreAdapter::new(open_sqlite(path).await?)))
                }
            };
        }

        Ok(cache)
    }
}

#[cfg(feature = "database")]
async fn open_sqlite(path: &Path) -> Result<Arc<dyn BarStore>> {
    Ok(Arc::new(crate::data::SqliteStore::open(path).await?))
}

#[cfg(not(feature = "database"))]
async fn open_sqlite(path: &Path) -> Result<Arc<dyn BarStore>> {
    Err(BacktestError::Configuration(format!(
        "sqlite database {} needs the `database` feature",
        path.display()
    )))
}

//complete run configuration, as stored in a json file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfiguration {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    #[serde(default)]
    pub data: DataSourceConfig,

    #[serde(default)]
    pub backtest: BacktestConfig,

    pub strategy: StrategyParams,

    //optional export directory for equity/trade csv and json
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl RunConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.instrument.split('/').filter(|s| !s.is_empty()).count() != 2 {
            return Err(BacktestError::Configuration(format!(
                "instrument must look like BASE/QUOTE, got {:?}",
                self.instrument
            )));
        }
        if self.start > self.end {
            return Err(BacktestError::Configuration(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if self.data.priority.is_empty() {
            return Err(BacktestError::Configuration(
                "at least one data source is required".to_string(),
            ));
        }
        self.backtest.validate()?;
        self.strategy.validate()
    }

    //load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: RunConfiguration = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    //save configuration to a JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FillTiming;

    const CONFIG: &str = r#"{
        "instrument": "BTC/USDT",
        "timeframe": "1h",
        "start": "2024-01-01T00:00:00Z",
        "end": "2024-02-01T00:00:00Z",
        "data": {"priority": ["csv", "remote"], "csvDir": "bars"},
        "backtest": {"initialCapital": 1000.0, "fillTiming": "next-open"},
        "strategy": {"type": "reversal", "bearThreshold": 3, "takeProfitPct": 3.0, "stopLossPct": -2.0}
    }"#;

    #[test]
    fn test_parse_run_configuration() {
        let config: RunConfiguration = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.timeframe, Timeframe::Hour1);
        assert_eq!(config.data.priority, vec![SourceKind::Csv, SourceKind::Remote]);
        assert_eq!(config.data.exchange_id, "binance");
        assert_eq!(config.backtest.fill_timing, FillTiming::NextOpen);
        assert_eq!(config.strategy.strategy_type(), StrategyType::Reversal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        let config: RunConfiguration = serde_json::from_str(CONFIG).unwrap();
        config.to_json_file(&path).unwrap();
        assert_eq!(RunConfiguration::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_validation_errors() {
        let mut config: RunConfiguration = serde_json::from_str(CONFIG).unwrap();
        config.instrument = "BTCUSDT".to_string();
        assert!(matches!(config.validate(), Err(BacktestError::Configuration(_))));

        let mut config: RunConfiguration = serde_json::from_str(CONFIG).unwrap();
        config.strategy = StrategyParams::SmaCrossover {
            fast_window: 20,
            slow_window: 5,
            sizing: Sizing::default(),
            close_at_end: false,
        };
        assert!(config.validate().is_err());

        let mut config: RunConfiguration = serde_json::from_str(CONFIG).unwrap();
        config.backtest.initial_capital = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_type_parse() {
        assert_eq!(StrategyType::parse("SMA"), Some(StrategyType::SmaCrossover));
        assert_eq!(StrategyType::parse("hold"), Some(StrategyType::BuyAndHold));
        assert_eq!(StrategyType::parse("rsi"), None);
        assert_eq!(
            StrategyParams::defaults(StrategyType::Reversal).label(),
            "reversal(3,3,-2)"
        );
    }
}
