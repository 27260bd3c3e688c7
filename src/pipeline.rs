/// Composition of the reading stream, the aggregator and the persistence sink
use std::sync::{Arc, Mutex};

use log::{error, info};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::aggregator::Aggregator;
use crate::database::Storage;
use crate::models::{HourlySummary, Reading};
use crate::utils::{format_datetime, format_rfc3339, format_time_hms, quality_label, round1};

/// Push events for dashboard clients, self-contained enough to render
/// without a follow-up query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    ReadingAccumulated {
        time: String,
        status: &'static str,
        accumulated_count: usize,
    },
    HourlySummary {
        timestamp: String,
        pm25: Value,
        pm1: Value,
        pm10: Value,
        temperature: Value,
        humidity: Value,
        aqi: Value,
        quality: &'static str,
        sample_count: i32,
        time: String,
    },
}

impl LiveEvent {
    pub fn reading_accumulated(at: &OffsetDateTime, accumulated_count: usize) -> Self {
        LiveEvent::ReadingAccumulated {
            time: format_time_hms(at),
            status: "collecting",
            accumulated_count,
        }
    }

    pub fn hourly_summary(summary: &HourlySummary, at: &OffsetDateTime) -> Self {
        LiveEvent::HourlySummary {
            timestamp: format_rfc3339(&summary.hour_start),
            pm25: metric_or_placeholder(summary.pm25_avg),
            pm1: metric_or_placeholder(summary.pm1_avg),
            pm10: metric_or_placeholder(summary.pm10_avg),
            temperature: metric_or_placeholder(summary.temperature_avg),
            humidity: metric_or_placeholder(summary.humidity_avg),
            aqi: match summary.aqi_avg {
                Some(aqi) => json!(aqi),
                None => json!("--"),
            },
            quality: quality_label(summary.aqi_avg),
            sample_count: summary.sample_count,
            time: format_time_hms(at),
        }
    }
}

fn metric_or_placeholder(value: Option<f32>) -> Value {
    match value {
        Some(v) => json!(round1(v)),
        None => json!("--"),
    }
}

/// Wires the device link's reading stream into the aggregator and the
/// persistence sink, and drives the hourly rollover on a one second tick.
///
/// The two spawned tasks are the only writers of the shared bucket; both
/// take the mutex for the in-memory mutation only and run persistence I/O
/// with the lock released, so neither can stall the other for longer than a
/// single statement.
pub struct Pipeline {
    aggregator: Arc<Mutex<Aggregator>>,
    storage: Arc<Storage>,
    events: broadcast::Sender<LiveEvent>,
}

impl Pipeline {
    pub fn new(
        aggregator: Arc<Mutex<Aggregator>>,
        storage: Arc<Storage>,
        events: broadcast::Sender<LiveEvent>,
    ) -> Self {
        Pipeline {
            aggregator,
            storage,
            events,
        }
    }

    /// Start the ingest and rollover tasks. Both stop when the shutdown
    /// flag flips; an in-flight summary write always completes first.
    pub fn spawn(
        self,
        readings: mpsc::Receiver<Reading>,
        shutdown: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let ingest = tokio::spawn(ingest_task(
            Arc::clone(&self.aggregator),
            Arc::clone(&self.storage),
            self.events.clone(),
            readings,
            shutdown.clone(),
        ));
        let rollover = tokio::spawn(rollover_task(
            self.aggregator,
            self.storage,
            self.events,
            shutdown,
        ));
        (ingest, rollover)
    }
}

/// Per reading: write-through persistence, bucket append, live notification.
/// A failed write drops the sample from durable storage but never stops the
/// stream.
async fn ingest_task(
    aggregator: Arc<Mutex<Aggregator>>,
    storage: Arc<Storage>,
    events: broadcast::Sender<LiveEvent>,
    mut readings: mpsc::Receiver<Reading>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let reading = tokio::select! {
            maybe = readings.recv() => match maybe {
                Some(reading) => reading,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        if let Err(e) = storage.save_reading(&reading).await {
            error!("Failed to persist reading: {}", e);
        }

        let timestamp = reading.timestamp;
        let accumulated = {
            let mut aggregator = aggregator.lock().unwrap();
            aggregator.ingest(reading);
            aggregator.sample_count()
        };

        let _ = events.send(LiveEvent::reading_accumulated(&timestamp, accumulated));
    }

    info!("Ingest task stopped");
}

/// One second rollover clock. The aggregator's unified trigger decides
/// whether the hour is due; the summary is persisted exactly once and then
/// pushed to live observers.
async fn rollover_task(
    aggregator: Arc<Mutex<Aggregator>>,
    storage: Arc<Storage>,
    events: broadcast::Sender<LiveEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let now = OffsetDateTime::now_utc();
                let summary = {
                    let mut aggregator = aggregator.lock().unwrap();
                    if aggregator.should_rollover(now) {
                        aggregator.rollover(now)
                    } else {
                        None
                    }
                };

                if let Some(summary) = summary {
                    info!(
                        "Hourly rollover: {} samples for {}",
                        summary.sample_count,
                        format_datetime(&summary.hour_start)
                    );
                    if let Err(e) = storage.save_hourly_summary(&summary).await {
                        error!("Failed to persist hourly summary: {}", e);
                    }
                    let _ = events.send(LiveEvent::hourly_summary(&summary, &now));
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("Rollover task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn reading_event_shape() {
        let at = datetime!(2025-03-04 13:05:09 UTC);
        let event = LiveEvent::reading_accumulated(&at, 7);
        let value = serde_json::to_value(&event).expect("serializes");

        assert_eq!(value["event"], "reading_accumulated");
        assert_eq!(value["data"]["time"], "13:05:09");
        assert_eq!(value["data"]["status"], "collecting");
        assert_eq!(value["data"]["accumulated_count"], 7);
    }

    #[test]
    fn summary_event_uses_placeholders_for_missing_metrics() {
        let summary = HourlySummary {
            hour_start: datetime!(2025-03-04 13:00:00 UTC),
            pm1_avg: None,
            pm25_avg: Some(25.14),
            pm10_avg: None,
            temperature_avg: Some(22.0),
            humidity_avg: Some(45.0),
            aqi_avg: Some(78),
            sample_count: 12,
        };
        let at = datetime!(2025-03-04 14:00:00 UTC);
        let value =
            serde_json::to_value(LiveEvent::hourly_summary(&summary, &at)).expect("serializes");

        assert_eq!(value["event"], "hourly_summary");
        assert_eq!(value["data"]["pm1"], "--");
        assert_eq!(value["data"]["pm10"], "--");
        assert_eq!(value["data"]["pm25"], 25.1f32 as f64);
        assert_eq!(value["data"]["aqi"], 78);
        assert_eq!(value["data"]["quality"], "Moderate");
        assert_eq!(value["data"]["sample_count"], 12);
    }

    #[test]
    fn summary_event_without_aqi_reads_unknown() {
        let summary = HourlySummary {
            hour_start: datetime!(2025-03-04 13:00:00 UTC),
            pm1_avg: None,
            pm25_avg: None,
            pm10_avg: None,
            temperature_avg: Some(21.5),
            humidity_avg: Some(40.0),
            aqi_avg: None,
            sample_count: 3,
        };
        let at = datetime!(2025-03-04 14:00:00 UTC);
        let value =
            serde_json::to_value(LiveEvent::hourly_summary(&summary, &at)).expect("serializes");

        assert_eq!(value["data"]["aqi"], "--");
        assert_eq!(value["data"]["quality"], "Unknown");
    }
}
