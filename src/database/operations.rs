/// Database operations for raw readings and hourly summaries
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::database::connection::{ensure_client, StorageError};
use crate::models::{CurrentHourStats, HourlySample, HourlySummary, LongTermStats, Reading};
use crate::utils::{calculate_aqi, format_rfc3339, round1};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS raw_readings (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
        pm1 REAL,
        pm25 REAL NOT NULL,
        pm10 REAL,
        temperature REAL NOT NULL,
        humidity REAL NOT NULL,
        aqi INTEGER
    );

    CREATE TABLE IF NOT EXISTS hourly_averages (
        id BIGSERIAL PRIMARY KEY,
        hour_start TIMESTAMPTZ NOT NULL UNIQUE,
        pm1_avg REAL,
        pm25_avg REAL,
        pm10_avg REAL,
        temperature_avg REAL,
        humidity_avg REAL,
        aqi_avg INTEGER,
        sample_count INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_raw_readings_timestamp
        ON raw_readings (timestamp);
    CREATE INDEX IF NOT EXISTS idx_hourly_averages_hour_start
        ON hourly_averages (hour_start);
";

/// Persistence sink for the pipeline and query source for the API.
///
/// Holds one lazily (re)established client behind a mutex; every operation
/// is a single short exclusive section, so a slow write can delay the other
/// pipeline activity by at most one statement. A failed statement invalidates
/// the cached client and the next operation reconnects.
pub struct Storage {
    database_url: String,
    client: Mutex<Option<Client>>,
}

impl Storage {
    pub fn new(database_url: &str) -> Self {
        Storage {
            database_url: database_url.to_string(),
            client: Mutex::new(None),
        }
    }

    /// Create tables and indexes when missing. Safe to call on every boot.
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        match client.batch_execute(SCHEMA).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *slot = None;
                Err(e.into())
            }
        }
    }

    /// Store one valid reading, write-through. The AQI column is derived
    /// from the reading's own pm25 so raw rows are self-describing.
    pub async fn save_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        let aqi = calculate_aqi(reading.pm25);

        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        let result = client
            .execute(
                "INSERT INTO raw_readings (timestamp, pm1, pm25, pm10, temperature, humidity, aqi)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &reading.timestamp,
                    &reading.pm1,
                    &reading.pm25,
                    &reading.pm10,
                    &reading.temperature,
                    &reading.humidity,
                    &aqi,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                *slot = None;
                Err(e.into())
            }
        }
    }

    /// Upsert one hourly summary keyed by its hour_start. Replaying the same
    /// hour overwrites the previous row, which keeps recovery idempotent.
    pub async fn save_hourly_summary(&self, summary: &HourlySummary) -> Result<(), StorageError> {
        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        let result = client
            .execute(
                "INSERT INTO hourly_averages
                     (hour_start, pm1_avg, pm25_avg, pm10_avg,
                      temperature_avg, humidity_avg, aqi_avg, sample_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (hour_start) DO UPDATE SET
                     pm1_avg = EXCLUDED.pm1_avg,
                     pm25_avg = EXCLUDED.pm25_avg,
                     pm10_avg = EXCLUDED.pm10_avg,
                     temperature_avg = EXCLUDED.temperature_avg,
                     humidity_avg = EXCLUDED.humidity_avg,
                     aqi_avg = EXCLUDED.aqi_avg,
                     sample_count = EXCLUDED.sample_count",
                &[
                    &summary.hour_start,
                    &summary.pm1_avg,
                    &summary.pm25_avg,
                    &summary.pm10_avg,
                    &summary.temperature_avg,
                    &summary.humidity_avg,
                    &summary.aqi_avg,
                    &summary.sample_count,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                *slot = None;
                Err(e.into())
            }
        }
    }

    /// Latest hourly summaries, newest first.
    pub async fn get_hourly_samples(&self, limit: i64) -> Result<Vec<HourlySample>, StorageError> {
        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        let result = client
            .query(
                "SELECT hour_start, pm25_avg, pm1_avg, pm10_avg,
                        temperature_avg, humidity_avg, aqi_avg, sample_count
                 FROM hourly_averages
                 ORDER BY hour_start DESC
                 LIMIT $1",
                &[&limit],
            )
            .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                *slot = None;
                return Err(e.into());
            }
        };

        Ok(rows
            .iter()
            .map(|row| HourlySample {
                timestamp: format_rfc3339(&row.get::<_, OffsetDateTime>(0)),
                pm25: row.get::<_, Option<f32>>(1).map(round1),
                pm1: row.get::<_, Option<f32>>(2).map(round1),
                pm10: row.get::<_, Option<f32>>(3).map(round1),
                temperature: row.get::<_, Option<f32>>(4).map(round1),
                humidity: row.get::<_, Option<f32>>(5).map(round1),
                aqi: row.get::<_, Option<i32>>(6),
                sample_count: row.get::<_, i32>(7),
            })
            .collect())
    }

    /// Aggregate over the raw readings of the trailing hour, with the
    /// collection progress derived from the first sample's age.
    pub async fn get_current_hour_stats(&self) -> Result<CurrentHourStats, StorageError> {
        let now = OffsetDateTime::now_utc();
        let cutoff = now - Duration::hours(1);

        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        let result = client
            .query_one(
                "SELECT COUNT(*),
                        AVG(pm1)::real, AVG(pm25)::real, AVG(pm10)::real,
                        AVG(temperature)::real, AVG(humidity)::real, AVG(aqi)::real,
                        MIN(timestamp), MAX(timestamp)
                 FROM raw_readings
                 WHERE timestamp >= $1",
                &[&cutoff],
            )
            .await;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                *slot = None;
                return Err(e.into());
            }
        };

        let sample_count: i64 = row.get(0);
        if sample_count == 0 {
            return Ok(CurrentHourStats::empty());
        }

        let first_sample: Option<OffsetDateTime> = row.get(7);
        let last_sample: Option<OffsetDateTime> = row.get(8);

        let (progress, remaining) = match first_sample {
            Some(first) => {
                let elapsed = (now - first).whole_seconds();
                (
                    round1((elapsed as f32 / 3600.0 * 100.0).min(100.0)),
                    (3600 - elapsed).max(0),
                )
            }
            None => (0.0, 3600),
        };

        Ok(CurrentHourStats {
            sample_count,
            pm1_avg: row.get::<_, Option<f32>>(1).map(round1),
            pm25_avg: row.get::<_, Option<f32>>(2).map(round1),
            pm10_avg: row.get::<_, Option<f32>>(3).map(round1),
            temperature_avg: row.get::<_, Option<f32>>(4).map(round1),
            humidity_avg: row.get::<_, Option<f32>>(5).map(round1),
            aqi_avg: row.get::<_, Option<f32>>(6).map(|v| v.round() as i32),
            progress,
            remaining,
            first_sample: first_sample.map(|ts| format_rfc3339(&ts)),
            last_sample: last_sample.map(|ts| format_rfc3339(&ts)),
        })
    }

    /// Totals over the whole measurement history.
    pub async fn get_long_term_stats(&self) -> Result<LongTermStats, StorageError> {
        let mut slot = self.client.lock().await;
        let client = ensure_client(&self.database_url, &mut slot).await?;
        let result = client
            .query_one(
                "SELECT (SELECT COUNT(*) FROM raw_readings),
                        (SELECT COUNT(*) FROM hourly_averages),
                        (SELECT MIN(timestamp) FROM raw_readings),
                        (SELECT MAX(timestamp) FROM raw_readings)",
                &[],
            )
            .await;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                *slot = None;
                return Err(e.into());
            }
        };

        Ok(LongTermStats {
            total_readings: row.get(0),
            total_hours: row.get(1),
            first_reading: row
                .get::<_, Option<OffsetDateTime>>(2)
                .map(|ts| format_rfc3339(&ts)),
            last_reading: row
                .get::<_, Option<OffsetDateTime>>(3)
                .map(|ts| format_rfc3339(&ts)),
        })
    }
}
