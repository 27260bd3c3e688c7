/// Thin HTTP and websocket mapping over the application context
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::aggregator::Aggregator;
use crate::database::Storage;
use crate::models::{
    CollectionProgress, CurrentHourStats, HourlySample, LinkState, LinkStatus, LongTermStats,
    Reading,
};
use crate::pipeline::LiveEvent;
use crate::sensor::DeviceLink;

const DEFAULT_SAMPLE_HOURS: i64 = 168; // 7 days * 24

/// Everything the route layer needs, constructed explicitly in main and
/// shared by reference. No ambient singletons.
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub link: Arc<tokio::sync::Mutex<DeviceLink>>,
    pub aggregator: Arc<Mutex<Aggregator>>,
    pub events: broadcast::Sender<LiveEvent>,
    pub readings_tx: mpsc::Sender<Reading>,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/hourly_samples", get(hourly_samples))
        .route("/api/current_stats", get(current_stats))
        .route("/api/current_progress", get(current_progress))
        .route("/api/long_term_stats", get(long_term_stats))
        .route("/api/sensor/status", get(sensor_status))
        .route("/api/sensor/connect", post(sensor_connect))
        .route("/api/sensor/disconnect", post(sensor_disconnect))
        .route("/api/sensor/command", post(sensor_command))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[derive(Deserialize)]
struct HourlySamplesParams {
    hours: Option<i64>,
}

async fn hourly_samples(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<HourlySamplesParams>,
) -> ApiResult<Vec<HourlySample>> {
    let limit = params.hours.unwrap_or(DEFAULT_SAMPLE_HOURS).clamp(1, 8760);
    ctx.storage
        .get_hourly_samples(limit)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn current_stats(State(ctx): State<Arc<AppContext>>) -> ApiResult<CurrentHourStats> {
    ctx.storage
        .get_current_hour_stats()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn current_progress(State(ctx): State<Arc<AppContext>>) -> Json<CollectionProgress> {
    let progress = ctx
        .aggregator
        .lock()
        .unwrap()
        .current_progress(OffsetDateTime::now_utc());
    Json(progress)
}

async fn long_term_stats(State(ctx): State<Arc<AppContext>>) -> ApiResult<LongTermStats> {
    ctx.storage
        .get_long_term_stats()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn sensor_status(State(ctx): State<Arc<AppContext>>) -> Json<LinkStatus> {
    Json(ctx.link.lock().await.status())
}

#[derive(Deserialize)]
struct ConnectRequest {
    port: Option<String>,
}

async fn sensor_connect(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<ConnectRequest>>,
) -> Json<Value> {
    let mut link = ctx.link.lock().await;

    if let Some(Json(request)) = body {
        if let Some(port) = request.port.filter(|p| !p.is_empty()) {
            link.set_port(port);
        }
    }

    // Reconnecting over a live link tears the old session down first.
    if link.state() != LinkState::Disconnected {
        link.disconnect().await;
    }

    match link.connect().await {
        Ok(()) => match link.start_reading(ctx.readings_tx.clone()) {
            Ok(()) => Json(json!({ "success": true, "message": "Connected to sensor" })),
            Err(e) => Json(json!({
                "success": false,
                "message": format!("Failed to start read loop: {}", e),
            })),
        },
        Err(e) => Json(json!({
            "success": false,
            "message": format!("Failed to connect: {}", e),
        })),
    }
}

async fn sensor_disconnect(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    ctx.link.lock().await.disconnect().await;
    Json(json!({ "success": true, "message": "Disconnected" }))
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

async fn sensor_command(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CommandRequest>,
) -> Json<Value> {
    match ctx.link.lock().await.send_command(&request.command).await {
        Ok(()) => Json(json!({ "success": true, "message": "Command sent" })),
        Err(e) => Json(json!({
            "success": false,
            "message": format!("Failed to send command: {}", e),
        })),
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    let events = ctx.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

/// Forward live events to one dashboard client. A client that falls behind
/// the broadcast buffer skips ahead instead of blocking the pipeline.
async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<LiveEvent>) {
    let (mut sink, mut stream) = socket.split();

    let greeting = json!({ "event": "connected", "data": { "message": "Connected to server" } });
    if sink.send(Message::Text(greeting.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Failed to encode live event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Websocket client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = stream.next() => match message {
                // Clients only listen; anything inbound except close is ignored.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Websocket client disconnected");
}
