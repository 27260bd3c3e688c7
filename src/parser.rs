/// Decoding of the sensor board's line protocol
use time::OffsetDateTime;

use crate::models::Reading;

/// Decode one line of the sensor's serial protocol into a Reading.
///
/// The board emits comma-separated `KEY:VALUE` tokens in arbitrary order,
/// e.g. `PM1:10.2,PM2.5:25.1,PM10:30.5,TEMP:22.5,HUM:45.0`. Keys are matched
/// case-insensitively with their firmware aliases; unknown keys and tokens
/// whose value fails to parse as a number are skipped without failing the
/// line. The timestamp is the capture time, the device transmits none.
///
/// Returns None for any line that does not carry all of pm25, temperature
/// and humidity. An incomplete sample is a routine outcome, not an error,
/// and is deliberately not logged to keep a noisy device from flooding logs.
pub fn parse_line(line: &str) -> Option<Reading> {
    parse_line_at(line, OffsetDateTime::now_utc())
}

/// Decode a line with an explicit capture timestamp.
pub fn parse_line_at(line: &str, timestamp: OffsetDateTime) -> Option<Reading> {
    let mut pm1 = None;
    let mut pm25 = None;
    let mut pm10 = None;
    let mut temperature = None;
    let mut humidity = None;

    for token in line.split(',') {
        let (key, value) = match token.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };

        let value: f32 = match value.trim().parse() {
            Ok(value) => value,
            Err(_) => continue,
        };

        match key.trim().to_uppercase().as_str() {
            "PM1" | "PM1.0" => pm1 = Some(value),
            "PM25" | "PM2.5" => pm25 = Some(value),
            "PM10" => pm10 = Some(value),
            "TEMP" | "TEMPERATURE" => temperature = Some(value),
            "HUM" | "HUMIDITY" => humidity = Some(value),
            _ => {}
        }
    }

    Some(Reading {
        timestamp,
        pm1,
        pm25: pm25?,
        pm10,
        temperature: temperature?,
        humidity: humidity?,
    })
}
