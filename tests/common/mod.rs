//shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use barcache::data::{Bar, BarSeries, Fetched, SeriesKey, SourceAdapter, SourceCoverage, TimeRange, Timeframe};
use barcache::error::{BacktestError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Mutex;

pub const INSTRUMENT: &str = "BTC/USDT";

//2024-01-01T00:00:00Z plus n hours
pub fn hour(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200, 0).unwrap() + Duration::hours(n)
}

pub fn range(start: i64, end: i64) -> TimeRange {
    TimeRange::new(hour(start), hour(end)).unwrap()
}

pub fn bar(ts: DateTime<Utc>, open: f64, close: f64) -> Bar {
    Bar::new(ts, open, open.max(close) + 1.0, open.min(close) - 1.0, close, 10.0).unwrap()
}

//hourly bars at hours first..=last, every close equal to `close`
pub fn flat_bars(first: i64, last: i64, close: f64) -> Vec<Bar> {
    (first..=last).map(|h| bar(hour(h), close, close)).collect()
}

//hourly bars from hour 1 with the given closes; each bar opens at the previous close
pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            bar(hour(i as i64 + 1), open, close)
        })
        .collect()
}

pub fn series_from_bars(bars: Vec<Bar>) -> BarSeries {
    BarSeries::from_bars(SeriesKey::new(INSTRUMENT, Timeframe::Hour1), bars).unwrap()
}

pub fn series_from_closes(closes: &[f64]) -> BarSeries {
    series_from_bars(bars_from_closes(closes))
}

//scripted source: serves its bars and vouches for the request clipped to `span`
pub struct MockAdapter {
    name: String,
    span: Option<TimeRange>,
    bars: Vec<Bar>,
    delay: Option<std::time::Duration>,
    failing: bool,
    calls: Mutex<Vec<TimeRange>>,
}

impl MockAdapter {
    pub fn new(name: &str, span: TimeRange, bars: Vec<Bar>) -> Self {
        MockAdapter {
            name: name.to_string(),
            span: Some(span),
            bars,
            delay: None,
            failing: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    //hourly bars at hours first..=last with a constant close
    pub fn flat(name: &str, first: i64, last: i64, close: f64) -> Self {
        MockAdapter::new(name, range(first, last), flat_bars(first, last, close))
    }

    //a source that has nothing and says so
    pub fn empty(name: &str) -> Self {
        MockAdapter {
            span: None,
            ..MockAdapter::new(name, range(0, 0), Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn calls(&self) -> Vec<TimeRange> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, key: &SeriesKey, range: TimeRange) -> Result<Fetched> {
        self.calls.lock().unwrap().push(range);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(BacktestError::source_unavailable(&self.name, "connection reset"));
        }

        let bars = self
            .bars
            .iter()
            .filter(|b| range.contains(b.timestamp))
            .cloned()
            .collect();
        let coverage = self
            .span
            .and_then(|span| span.intersect(&range))
            .map(|covered| vec![SourceCoverage::new(key, covered)])
            .unwrap_or_default();

        Ok(Fetched { bars, coverage })
    }
}
