use crate::data::bar::{Bar, SeriesKey, TimeRange};
use crate::data::series::{merge_ranges, QuarantinedBar};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

//bars, quarantine records and coverage for one key within a range
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSlice {
    pub bars: Vec<Bar>,
    pub quarantined: Vec<QuarantinedBar>,
    pub coverage: Vec<TimeRange>,
}

//persisted canonical store keyed by (instrument, timeframe, timestamp)
//implementations must enforce uniqueness on that key: a commit never replaces a stored bar
#[async_trait]
pub trait BarStore: Send + Sync {
    fn name(&self) -> &str;

    //ranges already resolved for the key, merged and sorted
    async fn coverage(&self, key: &SeriesKey) -> Result<Vec<TimeRange>>;

    async fn load(&self, key: &SeriesKey, range: TimeRange) -> Result<StoredSlice>;

    //persists bars and marks `covered` as resolved, atomically
    //returns the number of bars actually inserted
    async fn commit(
        &self,
        key: &SeriesKey,
        covered: TimeRange,
        bars: &[Bar],
        quarantined: &[QuarantinedBar],
    ) -> Result<usize>;
}

#[derive(Debug, Clone, Default)]
struct SeriesTable {
    bars: BTreeMap<DateTime<Utc>, Bar>,
    quarantined: BTreeMap<(DateTime<Utc>, String), QuarantinedBar>,
    coverage: Vec<TimeRange>,
}

//in-process store; readers get the last committed snapshot without waiting on writers
#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<SeriesKey, Arc<SeriesTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, key: &SeriesKey) -> Option<Arc<SeriesTable>> {
        self.tables.get(key).map(|t| Arc::clone(t.value()))
    }

    //number of bars stored for a key
    pub fn bar_count(&self, key: &SeriesKey) -> usize {
        self.snapshot(key).map(|t| t.bars.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BarStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn coverage(&self, key: &SeriesKey) -> Result<Vec<TimeRange>> {
        Ok(self
            .snapshot(key)
            .map(|t| t.coverage.clone())
            .unwrap_or_default())
    }

    async fn load(&self, key: &SeriesKey, range: TimeRange) -> Result<StoredSlice> {
        let table = match self.snapshot(key) {
            Some(table) => table,
            None => return Ok(StoredSlice::default()),
        };

        let bars = table
            .bars
            .range(range.start..=range.end)
            .map(|(_, bar)| bar.clone())
            .collect();

        let quarantined = table
            .quarantined
            .values()
            .filter(|q| range.contains(q.timestamp))
            .cloned()
            .collect();

        let coverage = table
            .coverage
            .iter()
            .filter_map(|c| c.intersect(&range))
            .collect();

        Ok(StoredSlice {
            bars,
            quarantined,
            coverage,
        })
    }

    async fn commit(
        &self,
        key: &SeriesKey,
        covered: TimeRange,
        bars: &[Bar],
        quarantined: &[QuarantinedBar],
    ) -> Result<usize> {
        let mut entry = self.tables.entry(key.clone()).or_default();
        //copy-on-write: snapshots handed to readers stay untouched
        let table = Arc::make_mut(entry.value_mut());

        let mut inserted = 0;
        for bar in bars {
            if !table.bars.contains_key(&bar.timestamp) {
                table.bars.insert(bar.timestamp, bar.clone());
                inserted += 1;
            }
        }

        for q in quarantined {
            table
                .quarantined
                .entry((q.timestamp, q.source.clone()))
                .or_insert_with(|| q.clone());
        }

        let mut coverage = std::mem::take(&mut table.coverage);
        coverage.push(covered);
        table.coverage = merge_ranges(coverage, key.timeframe);

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar::Timeframe;
    use chrono::TimeZone;

    fn ts(hours: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(hours * 3600, 0).unwrap()
    }

    fn bar(hours: i64, close: f64) -> Bar {
        Bar::new_unchecked(ts(hours), close, close, close, close, 1.0)
    }

    #[tokio::test]
    async fn test_commit_keeps_existing_bars() {
        let store = MemoryStore::new();
        let key = SeriesKey::new("ETH/USDT", Timeframe::Hour1);
        let r = TimeRange::new(ts(0), ts(2)).unwrap();

        let n = store
            .commit(&key, r, &[bar(0, 1.0), bar(1, 1.0)], &[])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let n = store
            .commit(&key, r, &[bar(1, 9.0), bar(2, 9.0)], &[])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let slice = store.load(&key, r).await.unwrap();
        assert_eq!(slice.bars.len(), 3);
        assert_eq!(slice.bars[1].close, 1.0);
        assert_eq!(store.coverage(&key).await.unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn test_coverage_merges_adjacent_commits() {
        let store = MemoryStore::new();
        let key = SeriesKey::new("ETH/USDT", Timeframe::Hour1);
        store
            .commit(&key, TimeRange::new(ts(0), ts(2)).unwrap(), &[], &[])
            .await
            .unwrap();
        store
            .commit(&key, TimeRange::new(ts(3), ts(5)).unwrap(), &[], &[])
            .await
            .unwrap();
        assert_eq!(
            store.coverage(&key).await.unwrap(),
            vec![TimeRange::new(ts(0), ts(5)).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_commits() {
        let store = MemoryStore::new();
        let key = SeriesKey::new("ETH/USDT", Timeframe::Hour1);
        let r = TimeRange::new(ts(0), ts(5)).unwrap();
        store.commit(&key, r, &[bar(0, 1.0)], &[]).await.unwrap();

        let before = store.snapshot(&key).unwrap();
        store.commit(&key, r, &[bar(1, 1.0)], &[]).await.unwrap();

        assert_eq!(before.bars.len(), 1);
        assert_eq!(store.bar_count(&key), 2);
    }
}
