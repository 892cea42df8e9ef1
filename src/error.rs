use crate::data::{SeriesKey, TimeRange};
use chrono::{DateTime, Utc};
use thiserror::Error;

//error taxonomy shared by the data cache and the engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    //no adapter could cover part of a requested range
    #[error("data unavailable for {key}: no source covers {range}")]
    DataUnavailable { key: SeriesKey, range: TimeRange },

    //a bar failed invariant checks (recorded, never fatal on its own)
    #[error("data integrity violation at {timestamp}: {reason}")]
    DataIntegrityViolation {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("strategy failed at bar {bar_index} ({timestamp}): {message}")]
    StrategyFailure {
        bar_index: usize,
        timestamp: DateTime<Utc>,
        message: String,
    },

    #[error("execution failed at bar {bar_index} ({timestamp}) for order {order_id}: {message}")]
    ExecutionFailure {
        bar_index: usize,
        timestamp: DateTime<Utc>,
        order_id: u64,
        message: String,
    },

    //interior gap under the fail gap policy
    #[error("gap of {missing} missing bars before bar {bar_index} ({timestamp})")]
    GapEncountered {
        bar_index: usize,
        timestamp: DateTime<Utc>,
        missing: usize,
    },

    #[error("run cancelled before bar {bar_index}")]
    Cancelled { bar_index: usize },

    #[error("configuration error: {0}")]
    Configuration(String),

    //transient adapter failure, the cache falls back to the next source
    #[error("source {source_name} unavailable: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl BacktestError {
    pub fn source_unavailable(source_name: impl Into<String>, message: impl ToString) -> Self {
        BacktestError::SourceUnavailable {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BacktestError>;
