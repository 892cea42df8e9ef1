use crate::data::bar::{Bar, BarError, SeriesKey, TimeRange, Timeframe};
use crate::error::BacktestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

//a run of missing expected timestamps
//before_index is the index of the first bar after the gap (len() for a trailing gap)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub before_index: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub missing: usize,
}

impl Gap {
    //gaps between two bars, as opposed to before the first or after the last
    pub fn is_interior(&self, series_len: usize) -> bool {
        self.before_index > 0 && self.before_index < series_len
    }
}

//a bar dropped because it failed validation, kept visible to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedBar {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub reason: String,
}

impl QuarantinedBar {
    pub fn to_error(&self) -> BacktestError {
        BacktestError::DataIntegrityViolation {
            timestamp: self.timestamp,
            reason: format!("{} (from {})", self.reason, self.source),
        }
    }
}

//a bar as returned by an adapter, tagged with the adapter's priority (0 = highest)
#[derive(Debug, Clone)]
pub struct SourcedBar {
    pub priority: usize,
    pub source: String,
    pub bar: Bar,
}

//canonical, ordered, gap-annotated bars for one instrument/timeframe
//read-only once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    key: SeriesKey,
    range: Option<TimeRange>,
    bars: Vec<Bar>,
    gaps: Vec<Gap>,
    quarantined: Vec<QuarantinedBar>,
}

impl BarSeries {
    //builds a series from bars that are already canonical
    //fails on the first bar that breaks ordering, alignment or ohlcv invariants
    pub fn from_bars(key: SeriesKey, bars: Vec<Bar>) -> Result<Self, BacktestError> {
        let range = match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.timestamp, last.timestamp),
            _ => None,
        };
        Self::assemble(key, range, bars, Vec::new())
    }

    //builds a series covering an explicit range; gaps are computed against that range
    pub fn assemble(
        key: SeriesKey,
        range: Option<TimeRange>,
        bars: Vec<Bar>,
        quarantined: Vec<QuarantinedBar>,
    ) -> Result<Self, BacktestError> {
        let timeframe = key.timeframe;

        for (i, bar) in bars.iter().enumerate() {
            check_bar(bar, timeframe).map_err(|e| BacktestError::DataIntegrityViolation {
                timestamp: bar.timestamp,
                reason: e.to_string(),
            })?;

            if i > 0 && bars[i - 1].timestamp >= bar.timestamp {
                return Err(BacktestError::DataIntegrityViolation {
                    timestamp: bar.timestamp,
                    reason: format!(
                        "timestamps not strictly increasing after {}",
                        bars[i - 1].timestamp
                    ),
                });
            }
        }

        let gaps = match range {
            Some(range) => detect_gaps(&bars, range, timeframe),
            None => Vec::new(),
        };

        Ok(BarSeries {
            key,
            range,
            bars,
            gaps,
            quarantined,
        })
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn instrument(&self) -> &str {
        &self.key.instrument
    }

    pub fn timeframe(&self) -> Timeframe {
        self.key.timeframe
    }

    pub fn range(&self) -> Option<TimeRange> {
        self.range
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    pub fn quarantined(&self) -> &[QuarantinedBar] {
        &self.quarantined
    }

    //the gap immediately preceding bar `index`, if any
    pub fn gap_before(&self, index: usize) -> Option<&Gap> {
        self.gaps.iter().find(|g| g.before_index == index)
    }
}

fn check_bar(bar: &Bar, timeframe: Timeframe) -> Result<(), BarError> {
    if !timeframe.is_aligned(bar.timestamp) {
        return Err(BarError::Misaligned {
            timestamp: bar.timestamp,
            timeframe,
        });
    }
    bar.validate()
}

//merges adapter responses into one canonical run of bars for `range`
//invalid bars are quarantined before dedup so a lower-priority source can fill the slot;
//on timestamp collision the higher-priority (lower number) bar wins, never a blend
pub fn canonicalize(
    timeframe: Timeframe,
    range: TimeRange,
    candidates: impl IntoIterator<Item = SourcedBar>,
) -> (Vec<Bar>, Vec<QuarantinedBar>) {
    let mut merged: BTreeMap<DateTime<Utc>, (usize, Bar)> = BTreeMap::new();
    let mut quarantined = Vec::new();

    for candidate in candidates {
        let bar = candidate.bar;

        //bars outside the requested range are not ours to judge
        if !range.contains(bar.timestamp) {
            continue;
        }

        if let Err(e) = check_bar(&bar, timeframe) {
            tracing::warn!(
                timestamp = %bar.timestamp,
                source = %candidate.source,
                reason = %e,
                "quarantining bar"
            );
            quarantined.push(QuarantinedBar {
                timestamp: bar.timestamp,
                source: candidate.source,
                reason: e.to_string(),
            });
            continue;
        }

        match merged.get(&bar.timestamp) {
            Some((existing, _)) if *existing <= candidate.priority => {}
            _ => {
                merged.insert(bar.timestamp, (candidate.priority, bar));
            }
        }
    }

    quarantined.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.source.cmp(&b.source))
    });
    quarantined.dedup();

    let bars = merged.into_values().map(|(_, bar)| bar).collect();
    (bars, quarantined)
}

//missing grid points inside range, grouped into runs
pub fn detect_gaps(bars: &[Bar], range: TimeRange, timeframe: Timeframe) -> Vec<Gap> {
    let step = timeframe.duration();
    let mut gaps = Vec::new();
    let mut expected = range.start;

    for (i, bar) in bars.iter().enumerate() {
        if bar.timestamp > expected {
            let to = bar.timestamp - step;
            gaps.push(Gap {
                before_index: i,
                from: expected,
                to,
                missing: ((to - expected).num_seconds() / timeframe.seconds() + 1) as usize,
            });
        }
        expected = bar.timestamp + step;
    }

    if expected <= range.end {
        gaps.push(Gap {
            before_index: bars.len(),
            from: expected,
            to: range.end,
            missing: ((range.end - expected).num_seconds() / timeframe.seconds() + 1) as usize,
        });
    }

    gaps
}

//sorts and coalesces overlapping or adjacent ranges
pub fn merge_ranges(mut ranges: Vec<TimeRange>, timeframe: Timeframe) -> Vec<TimeRange> {
    ranges.sort();
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());

    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + timeframe.duration() => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }

    merged
}

//parts of target (aligned) not covered by any of the given ranges
pub fn subtract_ranges(
    target: TimeRange,
    covered: &[TimeRange],
    timeframe: Timeframe,
) -> Vec<TimeRange> {
    let step = timeframe.duration();
    let mut missing = Vec::new();
    let mut cursor = target.start;

    for c in merge_ranges(covered.to_vec(), timeframe) {
        if c.end < cursor {
            continue;
        }
        if c.start > target.end {
            break;
        }
        if c.start > cursor {
            if let Some(hole) = TimeRange::new(cursor, timeframe.align_down(c.start - step)) {
                missing.push(hole);
            }
        }
        cursor = cursor.max(timeframe.align_down(c.end) + step);
        if cursor > target.end {
            return missing;
        }
    }

    if let Some(tail) = TimeRange::new(cursor, target.end) {
        missing.push(tail);
    }

    missing
}
