use crate::data::adapters::SourceAdapter;
use crate::data::bar::{SeriesKey, TimeRange, Timeframe};
use crate::data::series::{
    canonicalize, detect_gaps, merge_ranges, subtract_ranges, BarSeries, SourcedBar,
};
use crate::data::store::BarStore;
use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

//resolves requested ranges from the persisted store first, then from adapters in priority order
pub struct DataCache {
    store: Arc<dyn BarStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    fetch_timeout: Duration,
    //one writer per (instrument, timeframe)
    write_locks: DashMap<SeriesKey, Arc<Mutex<()>>>,
}

impl DataCache {
    pub fn new(store: Arc<dyn BarStore>, fetch_timeout: Duration) -> Self {
        DataCache {
            store,
            adapters: Vec::new(),
            fetch_timeout,
            write_locks: DashMap::new(),
        }
    }

    //appends an adapter below every adapter added before it
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn store(&self) -> &Arc<dyn BarStore> {
        &self.store
    }

    //canonical series for [start, end], fetching and persisting whatever is missing
    //fails with DataUnavailable rather than returning a truncated series
    pub async fn get(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries> {
        let key = SeriesKey::new(instrument, timeframe);
        let range = TimeRange::new(start, end)
            .and_then(|r| r.aligned(timeframe))
            .ok_or_else(|| {
                BacktestError::Configuration(format!(
                    "requested range [{}, {}] holds no {} bar",
                    start, end, timeframe
                ))
            })?;

        //committed ranges are served without taking the writer lock
        let covered = self.store.coverage(&key).await?;
        if !subtract_ranges(range, &covered, timeframe).is_empty() {
            let lock = self.write_lock(&key);
            let _guard = lock.lock().await;

            //a concurrent writer may have resolved part of it meanwhile
            let covered = self.store.coverage(&key).await?;
            let missing = subtract_ranges(range, &covered, timeframe);

            let mut unresolved = Vec::new();
            for piece in missing {
                unresolved.extend(self.resolve(&key, piece).await?);
            }

            if let Some(first) = unresolved.first() {
                warn!(key = %key, unresolved = unresolved.len(), range = %first, "data unavailable");
                return Err(BacktestError::DataUnavailable {
                    key,
                    range: *first,
                });
            }
        }

        let slice = self.store.load(&key, range).await?;
        let series = BarSeries::assemble(key, Some(range), slice.bars, slice.quarantined)?;

        debug!(
            key = %series.key(),
            bars = series.len(),
            gaps = series.gaps().len(),
            quarantined = series.quarantined().len(),
            "served series"
        );

        Ok(series)
    }

    //extends a cached series from its last committed bar up to `now`
    //nothing is fetched when the series was never cached or is already current
    pub async fn update_to(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Option<BarSeries>> {
        let key = SeriesKey::new(instrument, timeframe);
        let last = match self.store.coverage(&key).await?.last() {
            Some(covered) => covered.end,
            None => {
                debug!(key = %key, "nothing cached, no update");
                return Ok(None);
            }
        };

        let start = timeframe.align_down(last) + timeframe.duration();
        let end = timeframe.align_down(now);
        if start > end {
            debug!(key = %key, last = %last, "already current");
            return Ok(None);
        }

        info!(key = %key, from = %start, to = %end, "updating to now");
        self.get(instrument, timeframe, start, end).await.map(Some)
    }

    fn write_lock(&self, key: &SeriesKey) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    //walks the adapters for one missing piece, committing each covered part as it lands
    //slots a source vouched for but left empty (no bar, or a quarantined one) are offered
    //to the sources after it; they never count as unresolved
    //returns what no adapter could cover
    async fn resolve(&self, key: &SeriesKey, piece: TimeRange) -> Result<Vec<TimeRange>> {
        let timeframe = key.timeframe;
        let mut pending = vec![piece];
        let mut holes: Vec<TimeRange> = Vec::new();

        for (priority, adapter) in self.adapters.iter().enumerate() {
            if pending.is_empty() && holes.is_empty() {
                break;
            }

            let known = match timeout(self.fetch_timeout, adapter.available(key)).await {
                Ok(Ok(known)) => known.and_then(|c| c.range()),
                Ok(Err(e)) => {
                    warn!(source = adapter.name(), error = %e, "availability check failed");
                    continue;
                }
                Err(_) => {
                    warn!(source = adapter.name(), "availability check timed out");
                    continue;
                }
            };
            let may_hold = |part: &TimeRange| known.map_or(true, |k| k.intersect(part).is_some());

            let mut still_missing = Vec::new();
            let mut still_holes = Vec::new();

            for part in pending {
                if !may_hold(&part) {
                    still_missing.push(part);
                    continue;
                }
                match self.fetch_part(priority, adapter.as_ref(), key, part).await? {
                    Some(landed) => {
                        still_missing.extend(subtract_ranges(part, &landed.covered, timeframe));
                        still_holes.extend(landed.holes);
                    }
                    None => still_missing.push(part),
                }
            }

            for hole in holes {
                if !may_hold(&hole) {
                    still_holes.push(hole);
                    continue;
                }
                match self.fetch_part(priority, adapter.as_ref(), key, hole).await? {
                    Some(landed) => {
                        still_holes.extend(subtract_ranges(hole, &landed.covered, timeframe));
                        still_holes.extend(landed.holes);
                    }
                    None => still_holes.push(hole),
                }
            }

            pending = still_missing;
            holes = merge_ranges(still_holes, timeframe);
        }

        if !holes.is_empty() {
            debug!(key = %key, holes = holes.len(), "covered slots left without a valid bar");
        }

        Ok(pending)
    }

    //one fetch from one adapter; none when the adapter failed or timed out
    async fn fetch_part(
        &self,
        priority: usize,
        adapter: &dyn SourceAdapter,
        key: &SeriesKey,
        part: TimeRange,
    ) -> Result<Option<Landed>> {
        let timeframe = key.timeframe;
        debug!(source = adapter.name(), key = %key, range = %part, "fetching");

        let fetched = match timeout(self.fetch_timeout, adapter.fetch(key, part)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(source = adapter.name(), range = %part, error = %e, "fetch failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(
                    source = adapter.name(),
                    range = %part,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "fetch timed out"
                );
                return Ok(None);
            }
        };

        let covered: Vec<TimeRange> = fetched
            .coverage
            .iter()
            .filter(|c| c.instrument == key.instrument && c.timeframe == timeframe)
            .filter_map(|c| c.range())
            .filter_map(|r| r.intersect(&part))
            .filter_map(|r| r.aligned(timeframe))
            .collect();
        let covered = merge_ranges(covered, timeframe);
        let mut holes = Vec::new();

        for c in &covered {
            let candidates = fetched
                .bars
                .iter()
                .filter(|b| c.contains(b.timestamp))
                .map(|b| SourcedBar {
                    priority,
                    source: adapter.name().to_string(),
                    bar: b.clone(),
                });
            let (bars, quarantined) = canonicalize(timeframe, *c, candidates);
            let inserted = self.store.commit(key, *c, &bars, &quarantined).await?;

            holes.extend(
                detect_gaps(&bars, *c, timeframe)
                    .into_iter()
                    .filter_map(|gap| TimeRange::new(gap.from, gap.to)),
            );

            info!(
                source = adapter.name(),
                key = %key,
                range = %c,
                bars = inserted,
                quarantined = quarantined.len(),
                "committed range"
            );
        }

        Ok(Some(Landed { covered, holes }))
    }
}

//what one fetch committed: the ranges the source vouched for and the empty slots inside them
struct Landed {
    covered: Vec<TimeRange>,
    holes: Vec<TimeRange>,
}
