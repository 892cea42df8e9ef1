pub mod adapters;
pub mod bar;
pub mod cache;
pub mod series;
#[cfg(feature = "database")]
pub mod sqlite_store;
pub mod store;

pub use adapters::{
    CsvAdapter, Fetched, RemoteApiAdapter, RemoteApiConfig, SourceAdapter, SourceCoverage,
    StoreAdapter, TimestampConvention,
};
pub use bar::{Bar, BarError, SeriesKey, TimeRange, Timeframe};
pub use cache::DataCache;
pub use series::{BarSeries, Gap, QuarantinedBar, SourcedBar};
#[cfg(feature = "database")]
pub use sqlite_store::SqliteStore;
pub use store::{BarStore, MemoryStore, StoredSlice};
