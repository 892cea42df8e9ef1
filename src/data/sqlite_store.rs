//sqlite canonical store
//one logical bars table keyed by (instrument, timeframe, ts); the primary key rejects duplicates

use crate::data::bar::{Bar, SeriesKey, TimeRange};
use crate::data::series::{merge_ranges, QuarantinedBar};
use crate::data::store::{BarStore, StoredSlice};
use crate::error::{BacktestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::info;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS bars (
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        ts INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        PRIMARY KEY (instrument, timeframe, ts)
    )",
    "CREATE TABLE IF NOT EXISTS coverage (
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        start_ts INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        PRIMARY KEY (instrument, timeframe, start_ts)
    )",
    "CREATE TABLE IF NOT EXISTS quarantine (
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        ts INTEGER NOT NULL,
        source TEXT NOT NULL,
        reason TEXT NOT NULL,
        PRIMARY KEY (instrument, timeframe, ts, source)
    )",
];

fn storage(e: sqlx::Error) -> BacktestError {
    BacktestError::Storage(e.to_string())
}

fn from_epoch(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BacktestError::Storage(format!("timestamp out of range: {}", secs)))
}

pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
}

impl SqliteStore {
    //opens (creating if needed) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let store = SqliteStore {
            name: format!("sqlite:{}", path.display()),
            pool,
        };
        store.migrate().await?;
        info!(store = %store.name, "opened bar store");
        Ok(store)
    }

    //private in-memory database; one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;

        let store = SqliteStore {
            name: "sqlite::memory:".to_string(),
            pool,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BarStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn coverage(&self, key: &SeriesKey) -> Result<Vec<TimeRange>> {
        let rows = sqlx::query(
            "SELECT start_ts, end_ts FROM coverage
             WHERE instrument = ? AND timeframe = ? ORDER BY start_ts",
        )
        .bind(&key.instrument)
        .bind(key.timeframe.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut ranges = Vec::with_capacity(rows.len());
        for row in rows {
            let start = from_epoch(row.try_get("start_ts").map_err(storage)?)?;
            let end = from_epoch(row.try_get("end_ts").map_err(storage)?)?;
            ranges.extend(TimeRange::new(start, end));
        }
        Ok(merge_ranges(ranges, key.timeframe))
    }

    async fn load(&self, key: &SeriesKey, range: TimeRange) -> Result<StoredSlice> {
        let rows = sqlx::query(
            "SELECT ts, open, high, low, close, volume FROM bars
             WHERE instrument = ? AND timeframe = ? AND ts BETWEEN ? AND ?
             ORDER BY ts",
        )
        .bind(&key.instrument)
        .bind(key.timeframe.as_str())
        .bind(range.start.timestamp())
        .bind(range.end.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(Bar::new_unchecked(
                from_epoch(row.try_get("ts").map_err(storage)?)?,
                row.try_get("open").map_err(storage)?,
                row.try_get("high").map_err(storage)?,
                row.try_get("low").map_err(storage)?,
                row.try_get("close").map_err(storage)?,
                row.try_get("volume").map_err(storage)?,
            ));
        }

        let rows = sqlx::query(
            "SELECT ts, source, reason FROM quarantine
             WHERE instrument = ? AND timeframe = ? AND ts BETWEEN ? AND ?
             ORDER BY ts, source",
        )
        .bind(&key.instrument)
        .bind(key.timeframe.as_str())
        .bind(range.start.timestamp())
        .bind(range.end.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut quarantined = Vec::with_capacity(rows.len());
        for row in rows {
            quarantined.push(QuarantinedBar {
                timestamp: from_epoch(row.try_get("ts").map_err(storage)?)?,
                source: row.try_get("source").map_err(storage)?,
                reason: row.try_get("reason").map_err(storage)?,
            });
        }

        let coverage = self
            .coverage(key)
            .await?
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
        let timeframe = key.timeframe.as_str();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let mut inserted = 0;
        for bar in bars {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO bars (instrument, timeframe, ts, open, high, low, close, volume)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key.instrument)
            .bind(timeframe)
            .bind(bar.timestamp.timestamp())
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
            inserted += result.rows_affected() as usize;
        }

        for q in quarantined {
            sqlx::query(
                "INSERT OR IGNORE INTO quarantine (instrument, timeframe, ts, source, reason)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&key.instrument)
            .bind(timeframe)
            .bind(q.timestamp.timestamp())
            .bind(&q.source)
            .bind(&q.reason)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        //rewrite the key's coverage rows as one merged set
        let rows = sqlx::query(
            "SELECT start_ts, end_ts FROM coverage WHERE instrument = ? AND timeframe = ?",
        )
        .bind(&key.instrument)
        .bind(timeframe)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut ranges = vec![covered];
        for row in rows {
            let start = from_epoch(row.try_get("start_ts").map_err(storage)?)?;
            let end = from_epoch(row.try_get("end_ts").map_err(storage)?)?;
            ranges.extend(TimeRange::new(start, end));
        }

        sqlx::query("DELETE FROM coverage WHERE instrument = ? AND timeframe = ?")
            .bind(&key.instrument)
            .bind(timeframe)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        for range in merge_ranges(ranges, key.timeframe) {
            sqlx::query(
                "INSERT INTO coverage (instrument, timeframe, start_ts, end_ts) VALUES (?, ?, ?, ?)",
            )
            .bind(&key.instrument)
            .bind(timeframe)
            .bind(range.start.timestamp())
            .bind(range.end.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar::Timeframe;

    fn ts(hours: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(hours * 3600, 0).unwrap()
    }

    fn bar(hours: i64, close: f64) -> Bar {
        Bar::new_unchecked(ts(hours), close, close, close, close, 1.0)
    }

    #[tokio::test]
    async fn test_primary_key_rejects_duplicates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let key = SeriesKey::new("BTC/USDT", Timeframe::Hour1);
        let r = TimeRange::new(ts(0), ts(3)).unwrap();

        assert_eq!(store.commit(&key, r, &[bar(1, 1.0)], &[]).await.unwrap(), 1);
        assert_eq!(
            store
                .commit(&key, r, &[bar(1, 5.0), bar(2, 5.0)], &[])
                .await
                .unwrap(),
            1
        );

        let slice = store.load(&key, r).await.unwrap();
        assert_eq!(slice.bars.len(), 2);
        assert_eq!(slice.bars[0].close, 1.0);
        assert_eq!(slice.coverage, vec![r]);
    }

    #[tokio::test]
    async fn test_quarantine_and_coverage_persist() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bars.sqlite");
        let key = SeriesKey::new("BTC/USDT", Timeframe::Hour1);
        {
            let store = SqliteStore::open(&path).await.unwrap();
            let q = QuarantinedBar {
                timestamp: ts(2),
                source: "csv".into(),
                reason: "bad".into(),
            };
            store
                .commit(&key, TimeRange::new(ts(0), ts(2)).unwrap(), &[bar(0, 1.0)], &[q])
                .await
                .unwrap();
            store
                .commit(&key, TimeRange::new(ts(3), ts(4)).unwrap(), &[], &[])
                .await
                .unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.coverage(&key).await.unwrap(),
            vec![TimeRange::new(ts(0), ts(4)).unwrap()]
        );
        let slice = reopened
            .load(&key, TimeRange::new(ts(0), ts(4)).unwrap())
            .await
            .unwrap();
        assert_eq!(slice.quarantined.len(), 1);
        assert_eq!(slice.bars.len(), 1);
    }
}
