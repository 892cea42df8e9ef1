use crate::data::adapters::{Fetched, SourceAdapter, SourceCoverage};
use crate::data::bar::{SeriesKey, TimeRange};
use crate::data::store::BarStore;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

//exposes a relational or network-attached store as a read-only source
pub struct StoreAdapter {
    name: String,
    store: Arc<dyn BarStore>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        StoreAdapter {
            name: format!("store:{}", store.name()),
            store,
        }
    }
}

#[async_trait]
impl SourceAdapter for StoreAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn available(&self, key: &SeriesKey) -> Result<Option<SourceCoverage>> {
        let coverage = self.store.coverage(key).await?;
        let span = match (coverage.first(), coverage.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.start, last.end),
            _ => None,
        };
        Ok(span.map(|r| SourceCoverage::new(key, r)))
    }

    async fn fetch(&self, key: &SeriesKey, range: TimeRange) -> Result<Fetched> {
        let slice = self.store.load(key, range).await?;
        Ok(Fetched {
            bars: slice.bars,
            coverage: slice
                .coverage
                .into_iter()
                .map(|r| SourceCoverage::new(key, r))
                .collect(),
        })
    }
}
