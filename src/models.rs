use serde::Serialize;
use time::OffsetDateTime;

/// One decoded sensor sample. pm25, temperature and humidity are mandatory
/// for a line to produce a Reading at all; pm1/pm10 depend on the sensor
/// firmware and may be absent.
#[derive(Debug, Clone)]
pub struct Reading {
    pub timestamp: OffsetDateTime,
    pub pm1: Option<f32>,
    pub pm25: f32,
    pub pm10: Option<f32>,
    pub temperature: f32,
    pub humidity: f32,
}

/// Averages over one completed hour of readings. Produced exactly once per
/// hour by the aggregator's rollover; a metric is None when no reading in the
/// bucket contributed a value for it.
#[derive(Debug, Clone)]
pub struct HourlySummary {
    pub hour_start: OffsetDateTime,
    pub pm1_avg: Option<f32>,
    pub pm25_avg: Option<f32>,
    pub pm10_avg: Option<f32>,
    pub temperature_avg: Option<f32>,
    pub humidity_avg: Option<f32>,
    pub aqi_avg: Option<i32>,
    pub sample_count: i32,
}

/// Lifecycle of the serial link to the sensor board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reading,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reading => "reading",
        };
        f.write_str(name)
    }
}

/// Connection status as reported to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub state: LinkState,
    pub port: String,
    pub baud_rate: u32,
}

/// Progress of the in-flight hourly collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionProgress {
    pub samples_collected: usize,
    pub remaining: i64,
    pub progress: f32,
}

/// One row of the hourly_averages table, rounded for the API.
#[derive(Debug, Clone, Serialize)]
pub struct HourlySample {
    pub timestamp: String,
    pub pm25: Option<f32>,
    pub pm1: Option<f32>,
    pub pm10: Option<f32>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub aqi: Option<i32>,
    pub sample_count: i32,
}

/// SQL aggregate over the raw readings of the trailing hour.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentHourStats {
    pub sample_count: i64,
    pub pm1_avg: Option<f32>,
    pub pm25_avg: Option<f32>,
    pub pm10_avg: Option<f32>,
    pub temperature_avg: Option<f32>,
    pub humidity_avg: Option<f32>,
    pub aqi_avg: Option<i32>,
    pub progress: f32,
    pub remaining: i64,
    pub first_sample: Option<String>,
    pub last_sample: Option<String>,
}

impl CurrentHourStats {
    /// Stats for an hour with no readings at all.
    pub fn empty() -> Self {
        CurrentHourStats {
            sample_count: 0,
            pm1_avg: None,
            pm25_avg: None,
            pm10_avg: None,
            temperature_avg: None,
            humidity_avg: None,
            aqi_avg: None,
            progress: 0.0,
            remaining: 3600,
            first_sample: None,
            last_sample: None,
        }
    }
}

/// Totals over the whole measurement history.
#[derive(Debug, Clone, Serialize)]
pub struct LongTermStats {
    pub total_readings: i64,
    pub total_hours: i64,
    pub first_reading: Option<String>,
    pub last_reading: Option<String>,
}
