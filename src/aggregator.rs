/// Hourly accumulation of readings and the rollover state machine
use time::OffsetDateTime;

use crate::models::{CollectionProgress, HourlySummary, Reading};
use crate::utils::{calculate_aqi, round1, truncate_to_hour};

const HOUR_SECS: i64 = 3600;

/// The in-progress hour of readings. Owned exclusively by the Aggregator;
/// emptied and re-anchored only by rollover.
#[derive(Debug)]
struct HourlyBucket {
    start: OffsetDateTime,
    readings: Vec<Reading>,
}

/// Accumulates readings into the current hour's bucket and computes the
/// summary when the hour completes. Holds no clock of its own: the caller
/// passes `now` into every time-dependent operation, which keeps the whole
/// state machine deterministic under test.
#[derive(Debug)]
pub struct Aggregator {
    bucket: HourlyBucket,
    last_rollover_check: OffsetDateTime,
}

impl Aggregator {
    pub fn new(now: OffsetDateTime) -> Self {
        Aggregator {
            bucket: HourlyBucket {
                start: truncate_to_hour(now),
                readings: Vec::new(),
            },
            last_rollover_check: now,
        }
    }

    /// Append a reading to the current bucket.
    ///
    /// The first reading after a reset re-anchors the bucket to its own hour,
    /// so a bucket that sat empty across hour boundaries never mixes hours:
    /// each reading belongs to the hour that was open at its capture time.
    pub fn ingest(&mut self, reading: Reading) {
        if self.bucket.readings.is_empty() {
            self.bucket.start = truncate_to_hour(reading.timestamp);
        }
        self.bucket.readings.push(reading);
    }

    /// Number of readings accumulated in the current bucket.
    pub fn sample_count(&self) -> usize {
        self.bucket.readings.len()
    }

    /// Whether the hourly rollover is due.
    ///
    /// A single unified trigger: either the wall clock crossed an hour
    /// boundary since the last rollover check, or a full hour elapsed since
    /// it (the latter covers boundary checks missed during suspension).
    /// Because `rollover` records the check time, the trigger cannot fire
    /// twice for one boundary.
    pub fn should_rollover(&self, now: OffsetDateTime) -> bool {
        truncate_to_hour(now) > truncate_to_hour(self.last_rollover_check)
            || (now - self.last_rollover_check).whole_seconds() >= HOUR_SECS
    }

    /// Close the current bucket and produce its summary.
    ///
    /// Averages are arithmetic means over the readings that carried the
    /// metric; a metric nobody reported stays None. The summary's hour_start
    /// is the hour recorded when the bucket was opened, not the rollover
    /// time. An empty bucket produces nothing and keeps its start untouched.
    pub fn rollover(&mut self, now: OffsetDateTime) -> Option<HourlySummary> {
        self.last_rollover_check = now;

        if self.bucket.readings.is_empty() {
            return None;
        }

        let readings = &self.bucket.readings;
        let pm25_avg = mean(readings.iter().map(|r| r.pm25));
        let summary = HourlySummary {
            hour_start: self.bucket.start,
            pm1_avg: mean(readings.iter().filter_map(|r| r.pm1)),
            pm25_avg,
            pm10_avg: mean(readings.iter().filter_map(|r| r.pm10)),
            temperature_avg: mean(readings.iter().map(|r| r.temperature)),
            humidity_avg: mean(readings.iter().map(|r| r.humidity)),
            aqi_avg: pm25_avg.map(calculate_aqi),
            sample_count: readings.len() as i32,
        };

        self.bucket.readings.clear();
        self.bucket.start = truncate_to_hour(now);

        Some(summary)
    }

    /// Progress of the in-flight collection, measured from the first reading
    /// in the bucket. An empty bucket reports a full hour remaining.
    pub fn current_progress(&self, now: OffsetDateTime) -> CollectionProgress {
        let first = match self.bucket.readings.first() {
            Some(reading) => reading.timestamp,
            None => {
                return CollectionProgress {
                    samples_collected: 0,
                    remaining: HOUR_SECS,
                    progress: 0.0,
                }
            }
        };

        let elapsed = (now - first).whole_seconds();
        CollectionProgress {
            samples_collected: self.bucket.readings.len(),
            remaining: (HOUR_SECS - elapsed).max(0),
            progress: round1((elapsed as f32 / HOUR_SECS as f32 * 100.0).min(100.0)),
        }
    }
}

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let mut sum = 0.0f32;
    let mut count = 0u32;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(ts: OffsetDateTime, pm25: f32) -> Reading {
        Reading {
            timestamp: ts,
            pm1: None,
            pm25,
            pm10: None,
            temperature: 22.0,
            humidity: 45.0,
        }
    }

    #[test]
    fn empty_rollover_is_a_noop_and_keeps_hour_start() {
        let now = datetime!(2025-03-04 13:30:00 UTC);
        let mut agg = Aggregator::new(now);

        assert!(agg.rollover(datetime!(2025-03-04 14:00:01 UTC)).is_none());
        assert_eq!(agg.bucket.start, datetime!(2025-03-04 13:00:00 UTC));
    }

    #[test]
    fn averages_and_sample_count() {
        let now = datetime!(2025-03-04 13:00:00 UTC);
        let mut agg = Aggregator::new(now);

        for (minute, pm25) in [(5, 10.0), (15, 20.0), (25, 30.0)] {
            agg.ingest(reading(now + time::Duration::minutes(minute), pm25));
        }

        let summary = agg
            .rollover(datetime!(2025-03-04 14:00:00 UTC))
            .expect("bucket has readings");

        assert_eq!(summary.pm25_avg, Some(20.0));
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.hour_start, datetime!(2025-03-04 13:00:00 UTC));
        assert_eq!(summary.temperature_avg, Some(22.0));
        assert_eq!(summary.humidity_avg, Some(45.0));
        assert_eq!(summary.aqi_avg, Some(calculate_aqi(20.0)));
    }

    #[test]
    fn metrics_without_contributors_stay_none() {
        let now = datetime!(2025-03-04 13:00:00 UTC);
        let mut agg = Aggregator::new(now);
        agg.ingest(reading(now, 10.0));

        let summary = agg
            .rollover(datetime!(2025-03-04 14:00:00 UTC))
            .expect("one reading");

        assert_eq!(summary.pm1_avg, None);
        assert_eq!(summary.pm10_avg, None);
    }

    #[test]
    fn aqi_is_computed_even_for_a_zero_average() {
        let now = datetime!(2025-03-04 13:00:00 UTC);
        let mut agg = Aggregator::new(now);
        agg.ingest(reading(now, 0.0));

        let summary = agg
            .rollover(datetime!(2025-03-04 14:00:00 UTC))
            .expect("one reading");
        assert_eq!(summary.aqi_avg, Some(0));
    }

    #[test]
    fn rollover_clears_the_bucket_and_opens_the_new_hour() {
        let mut agg = Aggregator::new(datetime!(2025-03-04 13:00:00 UTC));
        agg.ingest(reading(datetime!(2025-03-04 13:10:00 UTC), 15.0));

        let rollover_time = datetime!(2025-03-04 14:00:02 UTC);
        agg.rollover(rollover_time).expect("summary produced");

        assert_eq!(agg.sample_count(), 0);
        assert_eq!(agg.bucket.start, datetime!(2025-03-04 14:00:00 UTC));

        agg.ingest(reading(datetime!(2025-03-04 14:05:00 UTC), 12.0));
        let next = agg
            .rollover(datetime!(2025-03-04 15:00:00 UTC))
            .expect("second summary");
        assert_eq!(next.hour_start, datetime!(2025-03-04 14:00:00 UTC));
    }

    #[test]
    fn ingest_into_empty_bucket_reanchors_to_the_reading_hour() {
        // The bucket was opened at 13:00 but stayed empty until 15:20.
        let mut agg = Aggregator::new(datetime!(2025-03-04 13:00:00 UTC));
        agg.ingest(reading(datetime!(2025-03-04 15:20:00 UTC), 18.0));

        let summary = agg
            .rollover(datetime!(2025-03-04 16:00:00 UTC))
            .expect("summary produced");
        assert_eq!(summary.hour_start, datetime!(2025-03-04 15:00:00 UTC));
    }

    #[test]
    fn trigger_fires_once_per_boundary() {
        let mut agg = Aggregator::new(datetime!(2025-03-04 13:59:30 UTC));
        agg.ingest(reading(datetime!(2025-03-04 13:59:40 UTC), 10.0));

        // Both conditions may be true in the same check cycle; after one
        // rollover the trigger must be quiet again.
        let boundary = datetime!(2025-03-04 14:00:00 UTC);
        assert!(agg.should_rollover(boundary));
        agg.rollover(boundary).expect("summary produced");
        assert!(!agg.should_rollover(boundary));
        assert!(!agg.should_rollover(datetime!(2025-03-04 14:00:01 UTC)));
    }

    #[test]
    fn trigger_covers_missed_boundaries() {
        // A process suspended across the boundary sees no minute-zero tick;
        // the elapsed-time half of the trigger still fires.
        let agg = Aggregator::new(datetime!(2025-03-04 13:30:00 UTC));
        assert!(agg.should_rollover(datetime!(2025-03-04 14:30:00 UTC)));
        assert!(!agg.should_rollover(datetime!(2025-03-04 13:59:59 UTC)));
    }

    #[test]
    fn progress_with_empty_bucket() {
        let now = datetime!(2025-03-04 13:00:00 UTC);
        let agg = Aggregator::new(now);

        assert_eq!(
            agg.current_progress(now),
            CollectionProgress {
                samples_collected: 0,
                remaining: 3600,
                progress: 0.0,
            }
        );
    }

    #[test]
    fn progress_tracks_elapsed_fraction() {
        let start = datetime!(2025-03-04 13:00:00 UTC);
        let mut agg = Aggregator::new(start);
        agg.ingest(reading(start, 10.0));

        let progress = agg.current_progress(start + time::Duration::minutes(18));
        assert_eq!(progress.samples_collected, 1);
        assert_eq!(progress.remaining, 3600 - 18 * 60);
        assert_eq!(progress.progress, 30.0);
    }

    #[test]
    fn progress_caps_at_the_full_hour() {
        let start = datetime!(2025-03-04 13:00:00 UTC);
        let mut agg = Aggregator::new(start);
        agg.ingest(reading(start, 10.0));

        let progress = agg.current_progress(start + time::Duration::minutes(90));
        assert_eq!(progress.progress, 100.0);
        assert_eq!(progress.remaining, 0);
    }
}
