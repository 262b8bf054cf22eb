use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::scheduler::Scheduler;
use crate::stats::ServiceStats;

const MAX_ERROR_RATE: f64 = 5.0;
const MIN_DIRECT_SEND_RATE: f64 = 80.0;

/// Register the temp-file cleanup and health monitor jobs.
pub async fn register_builtin_tasks(
    scheduler: &Scheduler,
    stats: Arc<ServiceStats>,
    storage: &StorageConfig,
) -> Result<()> {
    let temp_dir = storage.temp_dir.clone();
    let max_age = Duration::from_secs(storage.max_age_hours * 3600);
    scheduler
        .add_job(&storage.cleanup_cron, "temp-cleanup", move || {
            let dir = temp_dir.clone();
            Box::pin(async move {
                let removed = cleanup_temp_files(&dir, max_age).await?;
                if removed > 0 {
                    info!(removed, dir = %dir.display(), "Removed stale temp files");
                }
                Ok(())
            })
        })
        .await?;

    scheduler
        .add_job(&storage.health_check_cron, "health-monitor", move || {
            let stats = Arc::clone(&stats);
            Box::pin(async move {
                stats.mark_health_check();
                for warning in health_warnings(&stats) {
                    warn!(
                        error_rate = stats.error_rate(),
                        direct_sending_rate = stats.direct_sending_rate(),
                        "{}",
                        warning
                    );
                }
                Ok(())
            })
        })
        .await?;

    Ok(())
}

/// Delete regular files in `dir` last modified more than `max_age` ago.
/// A missing directory counts as empty.
pub async fn cleanup_temp_files(dir: &Path, max_age: Duration) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", dir.display()));
        }
    };

    let now = SystemTime::now();
    let mut stale: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if matches!(age, Some(age) if age > max_age) {
            stale.push(entry.path());
        }
    }

    let mut removed = 0;
    for path in stale {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed temp file");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
        }
    }
    Ok(removed)
}

/// Threshold breaches worth surfacing. Empty until traffic has been seen.
pub fn health_warnings(stats: &ServiceStats) -> Vec<String> {
    let mut warnings = Vec::new();
    if stats.received() == 0 {
        return warnings;
    }

    let error_rate = stats.error_rate();
    if error_rate > MAX_ERROR_RATE {
        warnings.push(format!("High error rate: {:.1}%", error_rate));
    }

    let direct_rate = stats.direct_sending_rate();
    if direct_rate < MIN_DIRECT_SEND_RATE {
        warnings.push(format!("Low direct sending rate: {:.1}%", direct_rate));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Route;
    use std::fs::File;

    #[tokio::test]
    async fn test_cleanup_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.bin");
        let fresh = dir.path().join("fresh.bin");

        let old_file = File::create(&old).unwrap();
        old_file
            .set_modified(SystemTime::now() - Duration::from_secs(48 * 3600))
            .unwrap();
        drop(old_file);
        File::create(&fresh).unwrap();

        let removed = cleanup_temp_files(dir.path(), Duration::from_secs(24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(
            cleanup_temp_files(&missing, Duration::from_secs(1)).await.unwrap(),
            0
        );
    }

    #[test]
    fn test_no_warnings_without_traffic() {
        let stats = ServiceStats::new(1);
        assert!(health_warnings(&stats).is_empty());
    }

    #[test]
    fn test_warnings_on_errors_and_low_direct_rate() {
        let stats = ServiceStats::new(1);
        for _ in 0..10 {
            stats.record_received(-1);
        }
        stats.record_error();
        stats.record_direct_send(Route::Pdf, 10);

        let warnings = health_warnings(&stats);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("error rate"));
        assert!(warnings[1].contains("direct sending"));
    }

    #[test]
    fn test_healthy_traffic_has_no_warnings() {
        let stats = ServiceStats::new(1);
        for _ in 0..5 {
            stats.record_received(-1);
            stats.record_direct_send(Route::Image, 10);
        }
        assert!(health_warnings(&stats).is_empty());
    }
}
