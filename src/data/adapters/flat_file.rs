use crate::data::adapters::{Fetched, SourceAdapter, SourceCoverage};
use crate::data::bar::{Bar, SeriesKey, TimeRange, Timeframe};
use crate::data::series::BarSeries;
use crate::error::{BacktestError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

//whether file timestamps mark the bar open (exchange downloads) or the bar close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampConvention {
    BarOpen,
    #[default]
    BarClose,
}

#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(alias = "timestamp")]
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    symbol: &'a str,
}

//parses rfc3339, "YYYY-MM-DD HH:MM:SS" (utc) or epoch milliseconds
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

//loads bars from a csv file, sorted by timestamp (duplicates are left for the cache to resolve)
pub fn load_csv<P: AsRef<Path>>(
    path: P,
    timeframe: Timeframe,
    convention: TimestampConvention,
) -> anyhow::Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .context(format!("Failed to open CSV file: {:?}", path))?;

    let mut bars = Vec::new();

    for (index, result) in reader.deserialize().enumerate() {
        let record: CsvRecord =
            result.context(format!("Failed to parse CSV record at line {}", index + 2))?;

        //parse timestamp
        let mut timestamp = parse_timestamp(&record.datetime).ok_or_else(|| {
            anyhow::anyhow!(
                "Failed to parse timestamp '{}' at line {}",
                record.datetime,
                index + 2
            )
        })?;

        if convention == TimestampConvention::BarOpen {
            timestamp += timeframe.duration();
        }

        bars.push(Bar::new_unchecked(
            timestamp,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
        ));
    }

    //sort by timestamp to ensure chronological order
    bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    Ok(bars)
}

//writes a series in bar-close convention, rfc3339 timestamps
pub fn save_series<P: AsRef<Path>>(series: &BarSeries, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create directory {:?}", parent))?;
    }

    let mut writer = WriterBuilder::new()
        .from_path(path)
        .context(format!("Failed to create CSV file: {:?}", path))?;

    for bar in series.bars() {
        writer.serialize(CsvRow {
            datetime: bar.timestamp.to_rfc3339(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            symbol: series.instrument(),
        })?;
    }

    writer.flush()?;
    Ok(())
}

//parsed file, valid while the file keeps its length and modification time
#[derive(Debug)]
struct ParsedFile {
    len: u64,
    modified: Option<SystemTime>,
    bars: Arc<Vec<Bar>>,
}

//flat-file archive: one csv per series named {exchange}_{BASE}_{QUOTE}_{timeframe}.csv
//each file is parsed once and reused until it changes on disk
#[derive(Debug, Clone)]
pub struct CsvAdapter {
    name: String,
    dir: PathBuf,
    exchange_id: String,
    convention: TimestampConvention,
    parsed: Arc<DashMap<SeriesKey, ParsedFile>>,
    parse_count: Arc<AtomicUsize>,
}

impl CsvAdapter {
    pub fn new(
        dir: impl Into<PathBuf>,
        exchange_id: impl Into<String>,
        convention: TimestampConvention,
    ) -> Self {
        let dir = dir.into();
        CsvAdapter {
            name: format!("csv:{}", dir.display()),
            dir,
            exchange_id: exchange_id.into(),
            convention,
            parsed: Arc::new(DashMap::new()),
            parse_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn path_for(&self, key: &SeriesKey) -> PathBuf {
        self.dir
            .join(format!("{}.csv", key.table_name(&self.exchange_id)))
    }

    //number of times a file was actually read and parsed
    pub fn parse_count(&self) -> usize {
        self.parse_count.load(Ordering::Relaxed)
    }

    async fn read_all(&self, key: &SeriesKey) -> Result<Arc<Vec<Bar>>> {
        let path = self.path_for(key);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Ok(Arc::new(Vec::new())),
        };
        let (len, modified) = (meta.len(), meta.modified().ok());

        if let Some(cached) = self.parsed.get(key) {
            if cached.len == len && cached.modified == modified {
                return Ok(Arc::clone(&cached.bars));
            }
        }

        let timeframe = key.timeframe;
        let convention = self.convention;
        let name = self.name.clone();

        let bars = tokio::task::spawn_blocking(move || load_csv(&path, timeframe, convention))
            .await
            .map_err(|e| BacktestError::source_unavailable(name.clone(), e))?
            .map_err(|e| BacktestError::source_unavailable(name, format!("{:#}", e)))?;

        self.parse_count.fetch_add(1, Ordering::Relaxed);
        debug!(source = %self.name, key = %key, bars = bars.len(), "parsed csv file");

        let bars = Arc::new(bars);
        self.parsed.insert(
            key.clone(),
            ParsedFile {
                len,
                modified,
                bars: Arc::clone(&bars),
            },
        );
        Ok(bars)
    }
}

fn file_range(bars: &[Bar]) -> Option<TimeRange> {
    match (bars.first(), bars.last()) {
        (Some(first), Some(last)) => TimeRange::new(first.timestamp, last.timestamp),
        _ => None,
    }
}

#[async_trait]
impl SourceAdapter for CsvAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn available(&self, key: &SeriesKey) -> Result<Option<SourceCoverage>> {
        let bars = self.read_all(key).await?;
        Ok(file_range(&bars).map(|r| SourceCoverage::new(key, r)))
    }

    async fn fetch(&self, key: &SeriesKey, range: TimeRange) -> Result<Fetched> {
        let all = self.read_all(key).await?;

        //the file vouches for everything between its first and last row
        let coverage = file_range(&all)
            .and_then(|r| r.intersect(&range))
            .map(|r| SourceCoverage::new(key, r));

        let bars = all
            .iter()
            .filter(|b| range.contains(b.timestamp))
            .cloned()
            .collect();

        Ok(Fetched {
            bars,
            coverage: coverage.into_iter().collect(),
        })
    }
}
