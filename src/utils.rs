/// Utility functions for data processing and formatting
use time::format_description::well_known::Rfc3339;
use time::{format_description, OffsetDateTime, Time};

/// US EPA PM2.5 breakpoints: (concentration low/high, index low/high).
/// Concentrations above the last band are clamped to its upper edge.
const AQI_BREAKPOINTS: [(f32, f32, f32, f32); 6] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 500.4, 301.0, 500.0),
];

/// Calculate the Air Quality Index from a PM2.5 concentration (µg/m³).
///
/// Linear interpolation inside the matching breakpoint band, floored to an
/// integer. Inputs outside [0, 500.4] are clamped before lookup.
pub fn calculate_aqi(pm25: f32) -> i32 {
    let c = pm25.clamp(0.0, 500.4);
    for &(c_lo, c_hi, i_lo, i_hi) in &AQI_BREAKPOINTS {
        if c <= c_hi {
            // Dividing before multiplying keeps band edges exact: c == c_hi
            // yields a ratio of exactly 1.0 and therefore exactly i_hi.
            return (i_lo + (i_hi - i_lo) * ((c - c_lo) / (c_hi - c_lo))).floor() as i32;
        }
    }
    500
}

/// Human-readable air quality category for an AQI value.
pub fn quality_label(aqi: Option<i32>) -> &'static str {
    match aqi {
        None => "Unknown",
        Some(v) if v <= 50 => "Good",
        Some(v) if v <= 100 => "Moderate",
        Some(v) if v <= 150 => "Unhealthy",
        Some(_) => "Hazardous",
    }
}

/// Truncate a timestamp down to its hour boundary.
pub fn truncate_to_hour(ts: OffsetDateTime) -> OffsetDateTime {
    match Time::from_hms(ts.hour(), 0, 0) {
        Ok(hour) => ts.replace_time(hour),
        Err(_) => ts,
    }
}

/// Round to one decimal place for display values.
pub fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
    {
        Ok(format) => format,
        Err(_) => return dt.to_string(),
    };
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format a timestamp as HH:MM:SS for live event payloads.
pub fn format_time_hms(dt: &OffsetDateTime) -> String {
    let format = match format_description::parse("[hour]:[minute]:[second]") {
        Ok(format) => format,
        Err(_) => return dt.to_string(),
    };
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format a timestamp as RFC 3339 for JSON payloads and database echoes.
pub fn format_rfc3339(dt: &OffsetDateTime) -> String {
    dt.format(&Rfc3339).unwrap_or_else(|_| dt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn aqi_exact_band_edges() {
        assert_eq!(calculate_aqi(0.0), 0);
        assert_eq!(calculate_aqi(12.0), 50);
        assert_eq!(calculate_aqi(35.4), 100);
        assert_eq!(calculate_aqi(55.4), 150);
        assert_eq!(calculate_aqi(150.4), 200);
        assert_eq!(calculate_aqi(250.4), 300);
        assert_eq!(calculate_aqi(500.4), 500);
    }

    #[test]
    fn aqi_interpolates_within_band() {
        // Midway through the first band: 6.0 of 12.0 maps to 25 of 50.
        assert_eq!(calculate_aqi(6.0), 25);
        // 25.1 µg/m³ sits in the 12.1..35.4 band: 51 + 49 * (13.0 / 23.3).
        assert_eq!(calculate_aqi(25.1), 78);
    }

    #[test]
    fn aqi_clamps_out_of_range_input() {
        assert_eq!(calculate_aqi(-3.0), 0);
        assert_eq!(calculate_aqi(1200.0), 500);
    }

    #[test]
    fn quality_label_covers_all_categories() {
        assert_eq!(quality_label(None), "Unknown");
        assert_eq!(quality_label(Some(0)), "Good");
        assert_eq!(quality_label(Some(50)), "Good");
        assert_eq!(quality_label(Some(51)), "Moderate");
        assert_eq!(quality_label(Some(100)), "Moderate");
        assert_eq!(quality_label(Some(150)), "Unhealthy");
        assert_eq!(quality_label(Some(151)), "Hazardous");
    }

    #[test]
    fn truncate_drops_minutes_and_seconds() {
        let ts = datetime!(2025-03-04 13:42:57.5 UTC);
        assert_eq!(truncate_to_hour(ts), datetime!(2025-03-04 13:00:00 UTC));
    }

    #[test]
    fn truncate_is_idempotent() {
        let ts = datetime!(2025-03-04 13:00:00 UTC);
        assert_eq!(truncate_to_hour(ts), ts);
    }

    #[test]
    fn round1_keeps_one_decimal() {
        assert_eq!(round1(25.14), 25.1);
        assert_eq!(round1(25.15), 25.2);
    }
}
