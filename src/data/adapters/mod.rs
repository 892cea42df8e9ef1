pub mod flat_file;
pub mod remote;
pub mod store_adapter;

use crate::data::bar::{Bar, SeriesKey, TimeRange, Timeframe};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use flat_file::{CsvAdapter, TimestampConvention};
pub use remote::{RemoteApiAdapter, RemoteApiConfig};
pub use store_adapter::StoreAdapter;

//range a source can or did supply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCoverage {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SourceCoverage {
    pub fn new(key: &SeriesKey, range: TimeRange) -> Self {
        SourceCoverage {
            instrument: key.instrument.clone(),
            timeframe: key.timeframe,
            start: range.start,
            end: range.end,
        }
    }

    pub fn range(&self) -> Option<TimeRange> {
        TimeRange::new(self.start, self.end)
    }
}

//raw adapter response; coverage lists the sub-ranges the source vouches for
//(empty when it had nothing for the request)
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub bars: Vec<Bar>,
    pub coverage: Vec<SourceCoverage>,
}

//one data origin; fetch once per call, the cache owns retry and fallback
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    //what the source is known to hold, if it can tell cheaply
    //none means "unknown, ask fetch"
    async fn available(&self, _key: &SeriesKey) -> Result<Option<SourceCoverage>> {
        Ok(None)
    }

    //fails with SourceUnavailable on transient errors
    async fn fetch(&self, key: &SeriesKey, range: TimeRange) -> Result<Fetched>;
}
