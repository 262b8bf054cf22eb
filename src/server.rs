use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::stats::{HealthStatus, ServiceStats, StatsSnapshot};

/// Static facts reported alongside live stats.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub configured_groups: usize,
    pub max_file_size_mb: f64,
    pub auto_compress: bool,
    pub watermark_enabled: bool,
    pub ffmpeg_available: bool,
    pub watermark_logo_loaded: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<ServiceStats>,
    pub info: Arc<ServiceInfo>,
    pub ws_interval: Duration,
}

#[derive(Debug, Serialize)]
struct Dependencies {
    ffmpeg: bool,
    watermark_logo: bool,
}

#[derive(Debug, Serialize)]
struct Configuration {
    configured_groups: usize,
    max_file_size_mb: f64,
    auto_compress: bool,
    watermark_enabled: bool,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: HealthStatus,
    version: &'static str,
    uptime_secs: u64,
    running: bool,
    listening: bool,
    telegram_connected: bool,
    dependencies: Dependencies,
    configuration: Configuration,
    stats: StatsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats_snapshot))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Serve the status API until `shutdown` resolves.
pub async fn serve<F>(config: &ServerConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, "Status server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Status server error")?;

    info!("Status server stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let stats = &state.stats;
    let info = &state.info;
    Json(HealthReport {
        status: stats.health(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: stats.uptime_secs().round() as u64,
        running: stats.is_running(),
        listening: stats.is_listening(),
        telegram_connected: stats.is_telegram_connected(),
        dependencies: Dependencies {
            ffmpeg: info.ffmpeg_available,
            watermark_logo: info.watermark_logo_loaded,
        },
        configuration: Configuration {
            configured_groups: info.configured_groups,
            max_file_size_mb: info.max_file_size_mb,
            auto_compress: info.auto_compress,
            watermark_enabled: info.watermark_enabled,
        },
        stats: stats.snapshot(),
    })
}

async fn stats_snapshot(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_stats(socket, state))
}

/// Push a stats snapshot on every tick until the client goes away.
async fn stream_stats(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut ticker = tokio::time::interval(state.ws_interval);
    debug!("WebSocket client connected");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = match serde_json::to_string(&state.stats.snapshot()) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize stats snapshot");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Route;

    async fn spawn_server(stats: Arc<ServiceStats>) -> String {
        let state = AppState {
            stats,
            info: Arc::new(ServiceInfo {
                configured_groups: 2,
                max_file_size_mb: 25.0,
                auto_compress: true,
                watermark_enabled: false,
                ffmpeg_available: false,
                watermark_logo_loaded: false,
            }),
            ws_interval: Duration::from_secs(5),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_reports_degraded_without_telegram() {
        let stats = Arc::new(ServiceStats::new(2));
        stats.set_running(true);
        let base = spawn_server(stats).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["telegram_connected"], false);
        assert_eq!(body["dependencies"]["ffmpeg"], false);
        assert_eq!(body["configuration"]["configured_groups"], 2);
        assert_eq!(body["stats"]["overview"]["success_rate"], 100.0);
    }

    #[tokio::test]
    async fn test_stats_endpoint_reflects_counters() {
        let stats = Arc::new(ServiceStats::new(1));
        stats.record_received(-100123);
        stats.record_replicated();
        stats.record_processed(Route::Image);
        stats.record_direct_send(Route::Image, 1024);
        let base = spawn_server(stats).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["overview"]["messages_received"], 1);
        assert_eq!(body["processing"]["images"], 1);
        assert_eq!(body["direct_sending"]["images"], 1);
        assert_eq!(body["direct_sending"]["rate"], 100.0);
        assert_eq!(body["groups"]["per_group"][0]["chat_id"], -100123);
    }
}
