pub mod tasks;

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Cron-driven background jobs (temp cleanup, health monitor)
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Add a recurring job. A failed run is logged as a structured warning and
    /// the job stays scheduled.
    pub async fn add_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                debug!(job = %name, "Running scheduled job");
                if let Err(e) = fut.await {
                    warn!(job = %name, error = %format!("{:#}", e), "Scheduled job failed");
                }
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!(job = %name, cron = %cron_expr, "Job scheduled");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let scheduler = Scheduler::new().await.unwrap();
        let result = scheduler
            .add_job("not a cron", "broken", || Box::pin(async { Ok(()) }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_valid_job_is_added() {
        let scheduler = Scheduler::new().await.unwrap();
        scheduler
            .add_job("*/30 * * * * *", "noop", || Box::pin(async { Ok(()) }))
            .await
            .unwrap();
    }
}
