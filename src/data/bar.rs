use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BarError {
    #[error("Invalid OHLC values: high ({high}) < low ({low})")]
    InvalidHighLow { high: f64, low: f64 },
    #[error("Invalid OHLC values: close ({close}) outside high-low range [{low}, {high}]")]
    InvalidClose { close: f64, high: f64, low: f64 },
    #[error("Invalid OHLC values: open ({open}) outside high-low range [{low}, {high}]")]
    InvalidOpen { open: f64, high: f64, low: f64 },
    #[error("Negative volume: {0}")]
    NegativeVolume(f64),
    #[error("Non-finite value in bar")]
    NonFinite,
    #[error("Timestamp {timestamp} is not aligned to the {timeframe} grid")]
    Misaligned {
        timestamp: DateTime<Utc>,
        timeframe: Timeframe,
    },
}

//represents a single ohlcv bar (candlestick) of market data
//timestamp is the bar close, utc
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    //creates a new Bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarError> {
        let bar = Bar::new_unchecked(timestamp, open, high, low, close, volume);
        bar.validate()?;
        Ok(bar)
    }

    //creates a Bar without validation
    pub fn new_unchecked(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    //checks low <= {open, close} <= high and volume >= 0
    pub fn validate(&self) -> Result<(), BarError> {
        let (open, high, low, close, volume) =
            (self.open, self.high, self.low, self.close, self.volume);

        if ![open, high, low, close, volume].iter().all(|v| v.is_finite()) {
            return Err(BarError::NonFinite);
        }

        //validate high >= low
        if high < low {
            return Err(BarError::InvalidHighLow { high, low });
        }

        //validate close within [low, high]
        if close < low || close > high {
            return Err(BarError::InvalidClose { close, high, low });
        }

        //validate open within [low, high]
        if open < low || open > high {
            return Err(BarError::InvalidOpen { open, high, low });
        }

        //validate non-negative volume
        if volume < 0.0 {
            return Err(BarError::NegativeVolume(volume));
        }

        Ok(())
    }

    //returns the typical price (HLC/3)
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    //returns the range (high - low)
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

//bar interval; timestamps are aligned to multiples of it since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Minute1,
    Minute3,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour12,
    Day1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 11] = [
        Timeframe::Minute1,
        Timeframe::Minute3,
        Timeframe::Minute5,
        Timeframe::Minute15,
        Timeframe::Minute30,
        Timeframe::Hour1,
        Timeframe::Hour2,
        Timeframe::Hour4,
        Timeframe::Hour6,
        Timeframe::Hour12,
        Timeframe::Day1,
    ];

    //parse timeframe from exchange notation (eg 1m, 4h, 1d)
    pub fn parse(s: &str) -> Option<Self> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute3 => "3m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour2 => "2h",
            Timeframe::Hour4 => "4h",
            Timeframe::Hour6 => "6h",
            Timeframe::Hour12 => "12h",
            Timeframe::Day1 => "1d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 60,
            Timeframe::Minute3 => 3 * 60,
            Timeframe::Minute5 => 5 * 60,
            Timeframe::Minute15 => 15 * 60,
            Timeframe::Minute30 => 30 * 60,
            Timeframe::Hour1 => 3600,
            Timeframe::Hour2 => 2 * 3600,
            Timeframe::Hour4 => 4 * 3600,
            Timeframe::Hour6 => 6 * 3600,
            Timeframe::Hour12 => 12 * 3600,
            Timeframe::Day1 => 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    //number of bars per year, used to annualise per-bar ratios
    //crypto venues trade around the clock
    pub fn periods_per_year(&self) -> f64 {
        365.0 * 86400.0 / self.seconds() as f64
    }

    pub fn is_aligned(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp.timestamp_subsec_nanos() == 0 && timestamp.timestamp() % self.seconds() == 0
    }

    //first grid point at or after timestamp
    pub fn align_up(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let down = self.align_down(timestamp);
        if down == timestamp {
            down
        } else {
            down + self.duration()
        }
    }

    //last grid point at or before timestamp
    pub fn align_down(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let secs = timestamp.timestamp().div_euclid(self.seconds()) * self.seconds();
        Utc.timestamp_opt(secs, 0).single().unwrap_or(timestamp)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value).ok_or_else(|| format!("unknown timeframe: {}", value))
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

//inclusive range of bar timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    //returns none when start > end
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if start > end {
            None
        } else {
            Some(TimeRange { start, end })
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        TimeRange::new(self.start.max(other.start), self.end.min(other.end))
    }

    //shrinks the range to grid points of the timeframe
    pub fn aligned(&self, timeframe: Timeframe) -> Option<TimeRange> {
        TimeRange::new(timeframe.align_up(self.start), timeframe.align_down(self.end))
    }

    //number of grid points in an aligned range
    pub fn bar_count(&self, timeframe: Timeframe) -> usize {
        ((self.end - self.start).num_seconds() / timeframe.seconds() + 1).max(0) as usize
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

//identifies one canonical series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, timeframe: Timeframe) -> Self {
        SeriesKey {
            instrument: instrument.into(),
            timeframe,
        }
    }

    //flat-file and table name, eg binance_BTC_USDT_1h
    pub fn table_name(&self, exchange_id: &str) -> String {
        format!(
            "{}_{}_{}",
            exchange_id,
            self.instrument.replace('/', "_"),
            self.timeframe
        )
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instrument, self.timeframe)
    }
}
