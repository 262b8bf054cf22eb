use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::compression::{size_mb, Compressor, GateOutcome, ImageCompressor, SizeGate};
use crate::config::ReplicationConfig;
use crate::discord::WebhookSender;
use crate::error::ReplicationError;
use crate::format::{self, AudioFormat, DISCORD_CONTENT_LIMIT};
use crate::platform::{IncomingMessage, Media, MediaSource, RemoteFile};
use crate::routing::{classify, extension_of, Route, RouteTable};
use crate::stats::ServiceStats;
use crate::watermark::{Watermarker, Watermarks};

/// How a routed message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Rejected,
    SendFailed,
    TimedOut,
    Failed,
}

/// A payload ready to post. Without `bytes` it is a plain text post: the
/// caption is watermarked and split when sent.
#[derive(Debug)]
pub struct ProcessedPayload {
    pub caption: String,
    pub bytes: Option<Vec<u8>>,
    pub filename: String,
    pub size_mb: f64,
}

/// Routes Telegram messages to their Discord webhook, one task per message.
pub struct Replicator {
    routes: Arc<RouteTable>,
    source: Arc<dyn MediaSource>,
    sender: Arc<dyn WebhookSender>,
    stats: Arc<ServiceStats>,
    gate: SizeGate,
    image_compressor: Arc<dyn Compressor>,
    video_compressor: Option<Arc<dyn Compressor>>,
    watermarks: Arc<Watermarks>,
    processing_timeout: Duration,
    image_download_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl Replicator {
    pub fn new(
        routes: Arc<RouteTable>,
        source: Arc<dyn MediaSource>,
        sender: Arc<dyn WebhookSender>,
        stats: Arc<ServiceStats>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            routes,
            source,
            sender,
            stats,
            gate: SizeGate::new(config.max_file_size_mb, config.auto_compress),
            image_compressor: Arc::new(ImageCompressor::new(config.compression_quality)),
            video_compressor: None,
            watermarks: Arc::new(Watermarks::default()),
            processing_timeout: Duration::from_secs(config.processing_timeout_secs),
            image_download_timeout: Duration::from_secs(config.image_download_timeout_secs),
            permits: Arc::new(Semaphore::new(config.max_concurrent_processing.max(1))),
        }
    }

    pub fn with_video_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.video_compressor = Some(compressor);
        self
    }

    #[cfg(test)]
    pub fn with_image_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.image_compressor = compressor;
        self
    }

    pub fn with_watermarks(mut self, watermarks: Arc<Watermarks>) -> Self {
        self.watermarks = watermarks;
        self
    }

    /// Spawn processing for a message. Messages from unrouted chats are
    /// dropped here without spawning anything.
    pub fn dispatch(self: &Arc<Self>, msg: IncomingMessage) -> Option<JoinHandle<Option<Outcome>>> {
        if !self.routes.contains(msg.chat_id) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.handle(msg).await }))
    }

    /// Process one message end to end. Returns `None` when the message was
    /// ignored: unrouted chat or nothing to send.
    pub async fn handle(&self, msg: IncomingMessage) -> Option<Outcome> {
        let webhook = self.routes.webhook_for(msg.chat_id)?.to_string();
        if msg.is_blank() {
            debug!(chat_id = msg.chat_id, "Skipping empty message");
            return None;
        }

        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        let started = Instant::now();
        self.stats.record_received(msg.chat_id);

        let route = classify(&msg);
        debug!(chat_id = msg.chat_id, route = %route, "Processing message");

        let watermark = self.watermarks.for_chat(msg.chat_id);
        let work = self.process(&webhook, route, &msg, &watermark);
        let outcome = match timeout(self.processing_timeout, work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.fail(&webhook, msg.chat_id, route, e).await,
            Err(_) => {
                let e = ReplicationError::Timeout {
                    kind: route,
                    secs: self.processing_timeout.as_secs(),
                };
                self.fail(&webhook, msg.chat_id, route, e).await
            }
        };

        if outcome == Outcome::Delivered {
            self.stats.record_replicated();
        }
        self.stats
            .record_processing_time(started.elapsed().as_millis() as u64);

        Some(outcome)
    }

    async fn fail(&self, webhook: &str, chat_id: i64, route: Route, e: ReplicationError) -> Outcome {
        match e {
            ReplicationError::Timeout { kind, secs } => {
                self.stats.record_timeout();
                warn!(chat_id, route = %kind, secs, "Message processing timed out");
                self.notify(webhook, &format::timeout_notice(kind, secs)).await;
                Outcome::TimedOut
            }
            other => {
                self.stats.record_error();
                error!(chat_id, route = %route, error = %other, "Message processing failed");
                self.notify(webhook, &format::error_notice(route)).await;
                Outcome::Failed
            }
        }
    }

    /// Best-effort text post used for terminal notices.
    async fn notify(&self, webhook: &str, text: &str) -> bool {
        let sent = self.sender.send_message(webhook, text).await;
        if !sent {
            self.stats.record_retry();
            warn!("Failed to post notification to Discord");
        }
        sent
    }

    async fn process(
        &self,
        webhook: &str,
        route: Route,
        msg: &IncomingMessage,
        watermark: &Arc<Watermarker>,
    ) -> Result<Outcome, ReplicationError> {
        let payload = match (&msg.media, route) {
            (None, _) | (_, Route::Text) => ProcessedPayload::text(msg.text()),
            (Some(media), Route::Other) => {
                ProcessedPayload::text(format::other_media_notice(media.kind(), msg.text()))
            }
            (Some(media), _) => match media.file() {
                Some(file) => {
                    return self
                        .replicate_media(webhook, route, media, file, msg.text(), watermark)
                        .await
                }
                None => ProcessedPayload::text(format::other_media_notice(media.kind(), msg.text())),
            },
        };
        Ok(self.deliver(webhook, route, payload, None, watermark).await)
    }

    async fn replicate_text(&self, webhook: &str, text: &str, watermark: &Watermarker) -> Outcome {
        let text = watermark.apply_text(text);
        for chunk in format::split_message(&text, DISCORD_CONTENT_LIMIT) {
            if !self.sender.send_message(webhook, &chunk).await {
                self.stats.record_retry();
                warn!("Text delivery to Discord failed");
                return Outcome::SendFailed;
            }
        }
        Outcome::Delivered
    }

    async fn download(&self, route: Route, file: &RemoteFile) -> Result<Vec<u8>, ReplicationError> {
        let result = if route == Route::Image {
            timeout(self.image_download_timeout, self.source.download(file))
                .await
                .map_err(|_| ReplicationError::Timeout {
                    kind: route,
                    secs: self.image_download_timeout.as_secs(),
                })?
        } else {
            self.source.download(file).await
        };

        result.map_err(|e| ReplicationError::Download {
            kind: route,
            reason: format!("{:#}", e),
        })
    }

    /// Apply the chat's watermark to image and video payloads. Returns the
    /// payload and whether it was changed.
    async fn watermark_media(
        &self,
        route: Route,
        data: Vec<u8>,
        watermark: &Arc<Watermarker>,
    ) -> Result<(Vec<u8>, bool), ReplicationError> {
        let original = data.len();
        let marked = match route {
            Route::Image if watermark.applies_to_images() => {
                let wm = Arc::clone(watermark);
                tokio::task::spawn_blocking(move || wm.apply_image(data))
                    .await
                    .map_err(|e| ReplicationError::Other(e.into()))?
            }
            Route::Video if watermark.applies_to_videos() => watermark.apply_video(data).await,
            _ => return Ok((data, false)),
        };
        let changed = marked.len() != original;
        Ok((marked, changed))
    }

    async fn replicate_media(
        &self,
        webhook: &str,
        route: Route,
        media: &Media,
        file: &RemoteFile,
        caption: &str,
        watermark: &Arc<Watermarker>,
    ) -> Result<Outcome, ReplicationError> {
        let data = self.download(route, file).await?;
        let downloaded = data.len();
        debug!(route = %route, size_mb = size_mb(downloaded), "Media downloaded");

        let (data, watermarked) = self.watermark_media(route, data, watermark).await?;

        let compressor: Option<&dyn Compressor> = match route {
            Route::Image => Some(self.image_compressor.as_ref()),
            Route::Video => self.video_compressor.as_deref(),
            _ => None,
        };

        // Savings are measured against the downloaded size, not the
        // intermediate watermarked encode.
        let (bytes, compressed_from) = match self.gate.admit(data, compressor).await {
            GateOutcome::Accepted {
                bytes,
                compressed_from,
            } => (bytes, compressed_from.map(|_| downloaded)),
            GateOutcome::Rejected { size_mb } => {
                self.stats.record_rejected();
                info!(route = %route, size_mb, "Payload over the size ceiling, rejected");
                let notice = format::rejection_notice(
                    route,
                    size_mb,
                    self.gate.max_file_size_mb(),
                    &caption_text(watermark, caption),
                );
                self.notify(webhook, &notice).await;
                return Ok(Outcome::Rejected);
            }
        };

        let payload = build_payload(
            route,
            media,
            &caption_text(watermark, caption),
            bytes,
            compressed_from.is_some(),
            watermarked,
        );
        Ok(self
            .deliver(webhook, route, payload, compressed_from, watermark)
            .await)
    }

    /// Post a payload. Compression is only counted once the compressed
    /// bytes have actually reached Discord.
    async fn deliver(
        &self,
        webhook: &str,
        route: Route,
        payload: ProcessedPayload,
        compressed_from: Option<usize>,
        watermark: &Watermarker,
    ) -> Outcome {
        let Some(bytes) = payload.bytes else {
            return self.replicate_text(webhook, &payload.caption, watermark).await;
        };

        let sent = self
            .sender
            .send_message_with_file(webhook, &payload.caption, &bytes, &payload.filename)
            .await;

        if sent {
            self.stats.record_processed(route);
            self.stats.record_direct_send(route, bytes.len());
            if let Some(original) = compressed_from {
                self.stats.record_compression(original, bytes.len());
            }
            info!(
                route = %route,
                filename = %payload.filename,
                size_mb = payload.size_mb,
                "Media replicated"
            );
            Outcome::Delivered
        } else {
            self.stats.record_retry();
            warn!(route = %route, filename = %payload.filename, "Media delivery to Discord failed");
            self.notify(webhook, &format::error_notice(route)).await;
            Outcome::SendFailed
        }
    }
}

impl ProcessedPayload {
    fn text(text: impl Into<String>) -> Self {
        Self {
            caption: text.into(),
            bytes: None,
            filename: String::new(),
            size_mb: 0.0,
        }
    }
}

fn caption_text(watermark: &Watermarker, caption: &str) -> String {
    if caption.trim().is_empty() {
        String::new()
    } else {
        watermark.apply_text(caption)
    }
}

fn build_payload(
    route: Route,
    media: &Media,
    caption: &str,
    bytes: Vec<u8>,
    compressed: bool,
    watermarked: bool,
) -> ProcessedPayload {
    let now = Local::now();
    let mb = size_mb(bytes.len());
    let original = media.filename();
    let original_ext = original.and_then(extension_of);

    let (filename, caption) = match route {
        Route::Audio => {
            let audio = AudioFormat::sniff(&bytes);
            let filename = format::smart_audio_filename(original, audio, now);
            let caption = format::build_audio_caption(&filename, mb, audio, caption);
            (filename, caption)
        }
        Route::Image => {
            let filename = if compressed {
                format::timestamped("image", "jpg", now)
            } else if watermarked {
                format::timestamped("image", "png", now)
            } else {
                format::timestamped("image", original_ext.as_deref().unwrap_or("jpg"), now)
            };
            let caption = format::build_caption(route, &filename, mb, caption);
            (filename, caption)
        }
        Route::Video => {
            let filename = match original {
                Some(name) if !compressed && !watermarked => name.to_string(),
                _ => format::timestamped("video", "mp4", now),
            };
            let caption = format::build_caption(route, &filename, mb, caption);
            (filename, caption)
        }
        Route::Pdf => {
            let filename = original
                .map(str::to_string)
                .unwrap_or_else(|| format::timestamped("document", "pdf", now));
            let caption = format::build_caption(route, &filename, mb, caption);
            (filename, caption)
        }
        Route::Document | Route::Text | Route::Other => {
            let filename = original
                .map(str::to_string)
                .unwrap_or_else(|| format::timestamped("file", "bin", now));
            let caption = format::build_caption(route, &filename, mb, caption);
            (filename, caption)
        }
    };

    ProcessedPayload {
        caption,
        bytes: Some(bytes),
        filename,
        size_mb: mb,
    }
}
