//binance-compatible kline adapter
//klines are keyed by open time and shifted one interval to the bar-close convention

use crate::data::adapters::{Fetched, SourceAdapter, SourceCoverage};
use crate::data::bar::{Bar, SeriesKey, TimeRange, Timeframe};
use crate::error::{BacktestError, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

//connection settings for a remote kline api, passed in at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteApiConfig {
    pub exchange_id: String,
    pub base_url: String,
    //sent as X-MBX-APIKEY when present; public klines need none
    #[serde(default)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub page_limit: usize,
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        RemoteApiConfig {
            exchange_id: "binance".to_string(),
            base_url: "https://api.binance.com".to_string(),
            api_key: None,
            request_timeout_secs: 10,
            page_limit: 1000,
        }
    }
}

pub struct RemoteApiAdapter {
    name: String,
    config: RemoteApiConfig,
    client: reqwest::Client,
}

impl RemoteApiAdapter {
    pub fn new(config: RemoteApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BacktestError::Configuration(format!("http client: {}", e)))?;

        Ok(RemoteApiAdapter {
            name: format!("remote:{}", config.exchange_id),
            config,
            client,
        })
    }

    async fn fetch_page(&self, symbol: &str, timeframe: Timeframe, from_ms: i64, to_ms: i64) -> Result<Value> {
        let url = format!("{}/api/v3/klines", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.get(&url).query(&[
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("startTime", from_ms.to_string()),
            ("endTime", to_ms.to_string()),
            ("limit", self.config.page_limit.to_string()),
        ]);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BacktestError::source_unavailable(self.name.clone(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BacktestError::source_unavailable(
                self.name.clone(),
                format!("HTTP {} from {}", status, url),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BacktestError::source_unavailable(self.name.clone(), e))
    }
}

//exchange symbol for an instrument, eg BTC/USDT -> BTCUSDT
pub fn exchange_symbol(instrument: &str) -> String {
    instrument.replace(['/', '-', '_'], "").to_uppercase()
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

//parses a kline page ([[openTime, open, high, low, close, volume, ...], ...])
//into bars stamped at their close
pub fn parse_klines(page: &Value, timeframe: Timeframe) -> std::result::Result<Vec<Bar>, String> {
    let rows = page
        .as_array()
        .ok_or_else(|| format!("expected an array of klines, got {}", page))?;

    rows.iter()
        .map(|row| {
            let fields = row
                .as_array()
                .filter(|f| f.len() >= 6)
                .ok_or_else(|| format!("malformed kline row: {}", row))?;
            let open_ms = fields[0]
                .as_i64()
                .ok_or_else(|| format!("bad open time in {}", row))?;
            let open_time = Utc
                .timestamp_millis_opt(open_ms)
                .single()
                .ok_or_else(|| format!("open time out of range: {}", open_ms))?;
            let mut values = [0.0; 5];
            for (slot, field) in values.iter_mut().zip(&fields[1..6]) {
                *slot = number(field).ok_or_else(|| format!("bad number in {}", row))?;
            }
            Ok(Bar::new_unchecked(
                open_time + timeframe.duration(),
                values[0],
                values[1],
                values[2],
                values[3],
                values[4],
            ))
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for RemoteApiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, key: &SeriesKey, range: TimeRange) -> Result<Fetched> {
        let timeframe = key.timeframe;
        let symbol = exchange_symbol(&key.instrument);
        let step_ms = timeframe.seconds() * 1000;

        //request by open time
        let mut from_ms = range.start.timestamp_millis() - step_ms;
        let to_ms = range.end.timestamp_millis() - step_ms;
        let mut bars: Vec<Bar> = Vec::new();

        while from_ms <= to_ms {
            let page = self.fetch_page(&symbol, timeframe, from_ms, to_ms).await?;
            let page_bars = parse_klines(&page, timeframe)
                .map_err(|e| BacktestError::source_unavailable(self.name.clone(), e))?;

            debug!(source = %self.name, key = %key, rows = page_bars.len(), "fetched kline page");

            let page_len = page_bars.len();
            let last_open_ms = match page_bars.last() {
                Some(bar) => bar.timestamp.timestamp_millis() - step_ms,
                None => break,
            };
            bars.extend(page_bars);

            //a short page means the venue has nothing further
            if page_len < self.config.page_limit || last_open_ms < from_ms {
                break;
            }
            from_ms = last_open_ms + step_ms;
        }

        //the venue is authoritative up to the last bar it returned
        let coverage = bars
            .last()
            .and_then(|last| TimeRange::new(range.start, last.timestamp.min(range.end)))
            .map(|r| SourceCoverage::new(key, r));

        bars.retain(|b| range.contains(b.timestamp));

        Ok(Fetched {
            bars,
            coverage: coverage.into_iter().collect(),
        })
    }
}
