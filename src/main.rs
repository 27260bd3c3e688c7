mod aggregator;
mod config;
mod database;
mod models;
mod parser;
mod pipeline;
mod sensor;
mod server;
mod utils;

use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout, Duration};

use aggregator::Aggregator;
use config::MonitorConfig;
use database::Storage;
use models::LinkState;
use pipeline::Pipeline;
use sensor::{discover_port, DeviceLink};
use server::AppContext;

const CONNECT_RETRY_DELAY_SECS: u64 = 30;
const READING_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 128;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connect the sensor link and start its read loop. Returns whether the
/// stream is up; failures are logged by the link itself.
async fn start_sensor(ctx: &Arc<AppContext>) -> bool {
    let mut link = ctx.link.lock().await;
    if link.connect().await.is_err() {
        return false;
    }
    match link.start_reading(ctx.readings_tx.clone()) {
        Ok(()) => {
            info!("Sensor read loop started");
            true
        }
        Err(e) => {
            error!("Failed to start read loop: {}", e);
            false
        }
    }
}

/// One scheduled reconnect attempt after a failed boot-time connect. If it
/// fails too, reconnecting becomes a manual action on the control API.
fn schedule_connect_retry(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        sleep(Duration::from_secs(CONNECT_RETRY_DELAY_SECS)).await;

        if ctx.link.lock().await.state() != LinkState::Disconnected {
            return;
        }

        info!("Retrying sensor connection");
        if !start_sensor(&ctx).await {
            warn!("Sensor still unreachable; use the control API to connect manually");
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match MonitorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!("Starting air quality monitor service");

    let storage = Arc::new(Storage::new(&config.database_url));
    // The cached client reconnects on demand, so boot survives a database
    // that is still coming up.
    if let Err(e) = storage.init_schema().await {
        error!("Schema initialization failed: {}", e);
    }

    let port = match config.sensor_port.clone() {
        Some(port) => port,
        None => discover_port(),
    };
    info!("Sensor port: {}", port);
    let link = Arc::new(tokio::sync::Mutex::new(DeviceLink::new(
        port,
        config.baud_rate,
    )));

    let aggregator = Arc::new(Mutex::new(Aggregator::new(OffsetDateTime::now_utc())));
    let (readings_tx, readings_rx) = mpsc::channel(READING_CHANNEL_CAPACITY);
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(AppContext {
        storage: Arc::clone(&storage),
        link,
        aggregator: Arc::clone(&aggregator),
        events: events_tx.clone(),
        readings_tx,
    });

    let pipeline = Pipeline::new(aggregator, storage, events_tx);
    let (ingest_task, rollover_task) = pipeline.spawn(readings_rx, shutdown_rx);

    if !start_sensor(&ctx).await {
        warn!(
            "Sensor not found. Retrying in {}s",
            CONNECT_RETRY_DELAY_SECS
        );
        schedule_connect_retry(Arc::clone(&ctx));
    }

    let listener = TcpListener::bind(&config.http_listen).await?;
    info!("Dashboard API listening on {}", config.http_listen);
    let app = server::router(Arc::clone(&ctx));
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Run until Ctrl+C, then unwind: stop the link, let in-flight pipeline
    // writes finish, stop serving.
    tokio::signal::ctrl_c().await?;
    info!("Program terminated by user. Exiting gracefully.");

    let _ = shutdown_tx.send(true);
    ctx.link.lock().await.disconnect().await;

    if timeout(SHUTDOWN_GRACE, ingest_task).await.is_err() {
        warn!("Ingest task did not stop within {:?}", SHUTDOWN_GRACE);
    }
    if timeout(SHUTDOWN_GRACE, rollover_task).await.is_err() {
        warn!("Rollover task did not stop within {:?}", SHUTDOWN_GRACE);
    }
    server_task.abort();

    Ok(())
}
