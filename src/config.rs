use std::env;

const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:5000";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    /// Serial port of the sensor board; None means probe for one.
    pub sensor_port: Option<String>,
    pub baud_rate: u32,
    pub http_listen: String,
}

impl MonitorConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable not set")?;

        let sensor_port = env::var("SENSOR_PORT").ok().filter(|p| !p.is_empty());

        let baud_rate = match env::var("SENSOR_BAUD") {
            Ok(raw) => raw
                .parse::<u32>()
                .map_err(|_| format!("SENSOR_BAUD is not a number: '{}'", raw))?,
            Err(_) => DEFAULT_BAUD_RATE,
        };

        let http_listen =
            env::var("HTTP_LISTEN").unwrap_or_else(|_| DEFAULT_HTTP_LISTEN.to_string());

        Ok(MonitorConfig {
            database_url,
            sensor_port,
            baud_rate,
            http_listen,
        })
    }
}
