use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::routing::Route;

/// Process-wide counters. Every field is monotonic for the lifetime of the
/// process; concurrent updates go through atomics or a short-held mutex.
#[derive(Debug)]
pub struct ServiceStats {
    started: Instant,
    started_at: DateTime<Utc>,
    configured_groups: usize,

    received: AtomicU64,
    replicated: AtomicU64,

    pdfs_processed: AtomicU64,
    audios_processed: AtomicU64,
    videos_processed: AtomicU64,
    images_processed: AtomicU64,
    documents_processed: AtomicU64,

    files_sent_direct: AtomicU64,
    images_sent_direct: AtomicU64,
    videos_sent_direct: AtomicU64,
    audios_sent_direct: AtomicU64,
    pdfs_sent_direct: AtomicU64,
    total_bytes_sent: AtomicU64,

    files_compressed: AtomicU64,
    compression_savings_bytes: AtomicU64,
    large_files_rejected: AtomicU64,

    errors: AtomicU64,
    retries: AtomicU64,
    timeout_errors: AtomicU64,

    processing_time_ms: AtomicU64,
    processing_samples: AtomicU64,

    groups: Mutex<HashMap<i64, u64>>,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,

    running: AtomicBool,
    listening: AtomicBool,
    telegram_connected: AtomicBool,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl ServiceStats {
    pub fn new(configured_groups: usize) -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            configured_groups,
            received: AtomicU64::new(0),
            replicated: AtomicU64::new(0),
            pdfs_processed: AtomicU64::new(0),
            audios_processed: AtomicU64::new(0),
            videos_processed: AtomicU64::new(0),
            images_processed: AtomicU64::new(0),
            documents_processed: AtomicU64::new(0),
            files_sent_direct: AtomicU64::new(0),
            images_sent_direct: AtomicU64::new(0),
            videos_sent_direct: AtomicU64::new(0),
            audios_sent_direct: AtomicU64::new(0),
            pdfs_sent_direct: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            files_compressed: AtomicU64::new(0),
            compression_savings_bytes: AtomicU64::new(0),
            large_files_rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            processing_time_ms: AtomicU64::new(0),
            processing_samples: AtomicU64::new(0),
            groups: Mutex::new(HashMap::new()),
            last_message_at: Mutex::new(None),
            last_health_check: Mutex::new(None),
            running: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            telegram_connected: AtomicBool::new(false),
        }
    }

    /// A routed message entered processing.
    pub fn record_received(&self, chat_id: i64) {
        bump(&self.received);
        if let Ok(mut groups) = self.groups.lock() {
            *groups.entry(chat_id).or_insert(0) += 1;
        }
        if let Ok(mut last) = self.last_message_at.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn record_replicated(&self) {
        bump(&self.replicated);
    }

    pub fn record_processed(&self, route: Route) {
        match route {
            Route::Pdf => bump(&self.pdfs_processed),
            Route::Audio => bump(&self.audios_processed),
            Route::Video => bump(&self.videos_processed),
            Route::Image => bump(&self.images_processed),
            Route::Document => bump(&self.documents_processed),
            Route::Text | Route::Other => {}
        }
    }

    /// A binary payload reached Discord.
    pub fn record_direct_send(&self, route: Route, bytes: usize) {
        bump(&self.files_sent_direct);
        self.total_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        match route {
            Route::Image => bump(&self.images_sent_direct),
            Route::Video => bump(&self.videos_sent_direct),
            Route::Audio => bump(&self.audios_sent_direct),
            Route::Pdf => bump(&self.pdfs_sent_direct),
            Route::Document | Route::Text | Route::Other => {}
        }
    }

    pub fn record_compression(&self, original: usize, compressed: usize) {
        bump(&self.files_compressed);
        self.compression_savings_bytes
            .fetch_add(original.saturating_sub(compressed) as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        bump(&self.large_files_rejected);
    }

    pub fn record_error(&self) {
        bump(&self.errors);
    }

    /// A timeout counts both as an error and as a timeout.
    pub fn record_timeout(&self) {
        bump(&self.errors);
        bump(&self.timeout_errors);
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn record_processing_time(&self, millis: u64) {
        self.processing_time_ms.fetch_add(millis, Ordering::Relaxed);
        bump(&self.processing_samples);
    }

    pub fn mark_health_check(&self) {
        if let Ok(mut last) = self.last_health_check.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Relaxed);
    }

    pub fn set_listening(&self, value: bool) {
        self.listening.store(value, Ordering::Relaxed);
    }

    pub fn set_telegram_connected(&self, value: bool) {
        self.telegram_connected.store(value, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    pub fn is_telegram_connected(&self) -> bool {
        self.telegram_connected.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn received(&self) -> u64 {
        load(&self.received)
    }

    pub fn replicated(&self) -> u64 {
        load(&self.replicated)
    }

    pub fn errors(&self) -> u64 {
        load(&self.errors)
    }

    pub fn retries(&self) -> u64 {
        load(&self.retries)
    }

    pub fn timeout_errors(&self) -> u64 {
        load(&self.timeout_errors)
    }

    pub fn large_files_rejected(&self) -> u64 {
        load(&self.large_files_rejected)
    }

    pub fn files_sent_direct(&self) -> u64 {
        load(&self.files_sent_direct)
    }

    pub fn files_compressed(&self) -> u64 {
        load(&self.files_compressed)
    }

    pub fn compression_savings_bytes(&self) -> u64 {
        load(&self.compression_savings_bytes)
    }

    pub fn processed(&self, route: Route) -> u64 {
        match route {
            Route::Pdf => load(&self.pdfs_processed),
            Route::Audio => load(&self.audios_processed),
            Route::Video => load(&self.videos_processed),
            Route::Image => load(&self.images_processed),
            Route::Document => load(&self.documents_processed),
            Route::Text | Route::Other => 0,
        }
    }

    pub fn sent_direct(&self, route: Route) -> u64 {
        match route {
            Route::Image => load(&self.images_sent_direct),
            Route::Video => load(&self.videos_sent_direct),
            Route::Audio => load(&self.audios_sent_direct),
            Route::Pdf => load(&self.pdfs_sent_direct),
            Route::Document | Route::Text | Route::Other => 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        success_rate(self.received(), self.replicated())
    }

    pub fn error_rate(&self) -> f64 {
        error_rate(self.received(), self.errors())
    }

    pub fn direct_sending_rate(&self) -> f64 {
        ratio_percent(self.files_sent_direct(), self.received())
    }

    pub fn health(&self) -> HealthStatus {
        if !self.is_running() {
            HealthStatus::Stopped
        } else if self.is_listening() && self.is_telegram_connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.uptime_secs();
        let received = self.received();

        let per_group = self
            .groups
            .lock()
            .map(|groups| {
                let mut entries: Vec<GroupCount> = groups
                    .iter()
                    .map(|(chat_id, messages)| GroupCount {
                        chat_id: *chat_id,
                        messages: *messages,
                    })
                    .collect();
                entries.sort_by_key(|entry| entry.chat_id);
                entries
            })
            .unwrap_or_default();

        let samples = load(&self.processing_samples);
        let avg_processing_ms = if samples == 0 {
            0.0
        } else {
            load(&self.processing_time_ms) as f64 / samples as f64
        };

        let saved = self.compression_savings_bytes();

        StatsSnapshot {
            overview: Overview {
                messages_received: received,
                messages_replicated: self.replicated(),
                success_rate: round2(self.success_rate()),
                error_rate: round2(self.error_rate()),
                throughput_per_minute: round2(throughput(received, uptime)),
                uptime_secs: uptime.round() as u64,
                uptime_hours: round2(uptime / 3600.0),
            },
            processing: Processing {
                pdfs: self.processed(Route::Pdf),
                audios: self.processed(Route::Audio),
                videos: self.processed(Route::Video),
                images: self.processed(Route::Image),
                documents: self.processed(Route::Document),
                avg_processing_ms: round2(avg_processing_ms),
            },
            direct_sending: DirectSending {
                files: self.files_sent_direct(),
                images: self.sent_direct(Route::Image),
                videos: self.sent_direct(Route::Video),
                audios: self.sent_direct(Route::Audio),
                pdfs: self.sent_direct(Route::Pdf),
                total_bytes: load(&self.total_bytes_sent),
                total_mb: round2(crate::compression::size_mb(
                    load(&self.total_bytes_sent) as usize,
                )),
                rate: round2(self.direct_sending_rate()),
            },
            compression: Compression {
                files_compressed: self.files_compressed(),
                savings_bytes: saved,
                savings_mb: round2(crate::compression::size_mb(saved as usize)),
                large_files_rejected: self.large_files_rejected(),
            },
            errors: Errors {
                total: self.errors(),
                retries: self.retries(),
                timeouts: self.timeout_errors(),
            },
            groups: Groups {
                configured: self.configured_groups,
                active: per_group.len(),
                per_group,
            },
            timestamps: Timestamps {
                started_at: self.started_at,
                last_message_at: self.last_message_at.lock().ok().and_then(|v| *v),
                last_health_check: self.last_health_check.lock().ok().and_then(|v| *v),
                generated_at: Utc::now(),
            },
        }
    }
}

pub fn success_rate(received: u64, replicated: u64) -> f64 {
    if received == 0 {
        100.0
    } else {
        replicated as f64 / received as f64 * 100.0
    }
}

pub fn error_rate(received: u64, errors: u64) -> f64 {
    ratio_percent(errors, received)
}

/// Messages per minute since startup.
pub fn throughput(received: u64, uptime_secs: f64) -> f64 {
    if uptime_secs <= 0.0 {
        0.0
    } else {
        received as f64 / uptime_secs * 60.0
    }
}

fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub overview: Overview,
    pub processing: Processing,
    pub direct_sending: DirectSending,
    pub compression: Compression,
    pub errors: Errors,
    pub groups: Groups,
    pub timestamps: Timestamps,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub messages_received: u64,
    pub messages_replicated: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub throughput_per_minute: f64,
    pub uptime_secs: u64,
    pub uptime_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Processing {
    pub pdfs: u64,
    pub audios: u64,
    pub videos: u64,
    pub images: u64,
    pub documents: u64,
    pub avg_processing_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectSending {
    pub files: u64,
    pub images: u64,
    pub videos: u64,
    pub audios: u64,
    pub pdfs: u64,
    pub total_bytes: u64,
    pub total_mb: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Compression {
    pub files_compressed: u64,
    pub savings_bytes: u64,
    pub savings_mb: f64,
    pub large_files_rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Errors {
    pub total: u64,
    pub retries: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Groups {
    pub configured: usize,
    pub active: usize,
    pub per_group: Vec<GroupCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupCount {
    pub chat_id: i64,
    pub messages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timestamps {
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_with_no_traffic() {
        let stats = ServiceStats::new(2);
        assert_eq!(stats.success_rate(), 100.0);
        assert_eq!(stats.error_rate(), 0.0);
        assert_eq!(stats.direct_sending_rate(), 0.0);
    }

    #[test]
    fn test_rates_after_traffic() {
        let stats = ServiceStats::new(1);
        for _ in 0..4 {
            stats.record_received(-100);
        }
        stats.record_replicated();
        stats.record_replicated();
        stats.record_replicated();
        stats.record_error();

        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(stats.error_rate(), 25.0);
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(10, 0.0), 0.0);
        assert_eq!(throughput(10, 60.0), 10.0);
        assert_eq!(throughput(30, 120.0), 15.0);
    }

    #[test]
    fn test_timeout_counts_as_error() {
        let stats = ServiceStats::new(0);
        stats.record_timeout();
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.timeout_errors(), 1);
    }

    #[test]
    fn test_direct_send_by_route() {
        let stats = ServiceStats::new(0);
        stats.record_direct_send(Route::Image, 2048);
        stats.record_direct_send(Route::Document, 1024);

        assert_eq!(stats.files_sent_direct(), 2);
        assert_eq!(stats.sent_direct(Route::Image), 1);
        assert_eq!(stats.sent_direct(Route::Document), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.direct_sending.total_bytes, 3072);
    }

    #[test]
    fn test_compression_savings() {
        let stats = ServiceStats::new(0);
        stats.record_compression(40 * 1024 * 1024, 8 * 1024 * 1024);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.compression.files_compressed, 1);
        assert_eq!(snapshot.compression.savings_mb, 32.0);
    }

    #[test]
    fn test_snapshot_groups_sorted() {
        let stats = ServiceStats::new(3);
        stats.record_received(-5);
        stats.record_received(-10);
        stats.record_received(-5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.groups.configured, 3);
        assert_eq!(snapshot.groups.active, 2);
        assert_eq!(snapshot.groups.per_group[0].chat_id, -10);
        assert_eq!(snapshot.groups.per_group[1].messages, 2);
        assert!(snapshot.timestamps.last_message_at.is_some());
    }

    #[test]
    fn test_health_status() {
        let stats = ServiceStats::new(0);
        assert_eq!(stats.health(), HealthStatus::Stopped);

        stats.set_running(true);
        assert_eq!(stats.health(), HealthStatus::Degraded);

        stats.set_listening(true);
        stats.set_telegram_connected(true);
        assert_eq!(stats.health(), HealthStatus::Healthy);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ServiceStats::new(1);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["overview"]["success_rate"], 100.0);
        assert!(json["timestamps"]["last_health_check"].is_null());
    }
}
