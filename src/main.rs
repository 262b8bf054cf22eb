mod compression;
mod config;
mod discord;
mod error;
mod format;
mod platform;
mod replicator;
mod routing;
mod scheduler;
mod server;
mod stats;
mod watermark;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::compression::{Ffmpeg, VideoCompressor};
use crate::config::{Config, StorageConfig};
use crate::discord::{DiscordWebhook, WebhookSender};
use crate::platform::telegram::{self, TelegramMediaSource};
use crate::replicator::Replicator;
use crate::scheduler::Scheduler;
use crate::server::{AppState, ServiceInfo};
use crate::stats::ServiceStats;
use crate::watermark::Watermarks;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

async fn start_scheduler(stats: Arc<ServiceStats>, storage: &StorageConfig) -> Result<Scheduler> {
    let scheduler = Scheduler::new().await?;
    scheduler::tasks::register_builtin_tasks(&scheduler, stats, storage).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telecord=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let routes = Arc::new(config.route_table());
    info!("Configuration loaded successfully");
    info!("  Routed chats: {:?}", routes.chat_ids());
    info!("  Max file size: {} MB", config.replication.max_file_size_mb);
    info!("  Auto compress: {}", config.replication.auto_compress);
    info!("  Concurrency: {}", config.replication.max_concurrent_processing);

    let stats = Arc::new(ServiceStats::new(routes.len()));
    stats.set_running(true);

    let sender = Arc::new(
        DiscordWebhook::new(&config.discord).context("Failed to build Discord webhook client")?,
    );
    let bot = telegram::build_bot(&config.telegram);
    let source = Arc::new(TelegramMediaSource::new(bot.clone()));

    let ffmpeg = Ffmpeg::new(&config.replication, config.storage.temp_dir.clone());
    let ffmpeg_available = ffmpeg.is_available().await;
    if !ffmpeg_available {
        warn!(
            ffmpeg = %config.replication.ffmpeg_path,
            "ffmpeg not available, oversized videos will be rejected and not watermarked"
        );
    }
    let ffmpeg = ffmpeg_available.then_some(ffmpeg);

    let watermarks = Arc::new(Watermarks::from_config(&config.watermark, ffmpeg.clone()));

    let mut replicator = Replicator::new(
        Arc::clone(&routes),
        source,
        sender.clone(),
        Arc::clone(&stats),
        &config.replication,
    )
    .with_watermarks(Arc::clone(&watermarks));
    if let Some(ffmpeg) = ffmpeg {
        let video = VideoCompressor::new(ffmpeg, config.replication.video_crf);
        replicator = replicator.with_video_compressor(Arc::new(video));
    }
    let replicator = Arc::new(replicator);

    let mut scheduler = match start_scheduler(Arc::clone(&stats), &config.storage).await {
        Ok(scheduler) => Some(scheduler),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Background jobs disabled");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = if config.server.enabled {
        let state = AppState {
            stats: Arc::clone(&stats),
            info: Arc::new(ServiceInfo {
                configured_groups: routes.len(),
                max_file_size_mb: config.replication.max_file_size_mb,
                auto_compress: config.replication.auto_compress,
                watermark_enabled: watermarks.any_enabled(),
                ffmpeg_available,
                watermark_logo_loaded: watermarks.any_logo(),
            }),
            ws_interval: Duration::from_secs(config.server.ws_interval_secs.max(1)),
        };
        let server_config = config.server.clone();
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = server::serve(&server_config, state, shutdown).await {
                error!(error = %format!("{:#}", e), "Status server failed");
            }
        }))
    } else {
        None
    };

    let connected = telegram::verify(&bot).await;
    stats.set_telegram_connected(connected);

    if connected {
        stats.set_listening(true);
        telegram::run(bot, replicator).await?;
        stats.set_listening(false);
    } else {
        error!("Telegram is unavailable; serving status endpoints only. Press Ctrl-C to exit.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    info!("Shutting down...");
    stats.set_running(false);

    let shutdown = async {
        let _ = shutdown_tx.send(());
        if let Some(handle) = server_handle {
            let _ = handle.await;
        }
        sender.close().await;
        if let Some(scheduler) = scheduler.as_mut() {
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Scheduler did not stop cleanly");
            }
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        warn!("Shutdown did not finish within {}s", SHUTDOWN_TIMEOUT.as_secs());
    }

    info!("Goodbye");
    Ok(())
}
