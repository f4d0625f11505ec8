//! Cron schedule driving the outbox publisher.

use std::sync::Arc;

use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info};

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;

use crate::publisher::OutboxPublisher;

/// Runs [`OutboxPublisher::publish_pending`] on a cron tick.
///
/// Ticks that fire while a pass is still running are dropped by the
/// publisher, not queued.
pub struct OutboxScheduler {
    /// The underlying job scheduler.
    scheduler: JobScheduler,
    /// Publisher invoked on every tick.
    publisher: Arc<OutboxPublisher>,
}

impl std::fmt::Debug for OutboxScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxScheduler").finish()
    }
}

impl OutboxScheduler {
    /// Create a new scheduler for `publisher`.
    pub async fn new(publisher: Arc<OutboxPublisher>) -> AppResult<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {e}")))?;

        Ok(Self {
            scheduler,
            publisher,
        })
    }

    /// Register the publish job on `schedule` (six-field cron, seconds first).
    pub async fn register_publish(&self, schedule: &str) -> AppResult<()> {
        let publisher = Arc::clone(&self.publisher);
        let job = CronJob::new_async(schedule, move |_uuid, _lock| {
            let publisher = Arc::clone(&publisher);
            Box::pin(async move {
                match publisher.publish_pending().await {
                    Ok(Some(report)) => debug!(published = report.published, "Publish tick done"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Outbox publish pass failed"),
                }
            })
        })
        .map_err(|e| {
            AppError::configuration(format!("Invalid publish schedule '{schedule}': {e}"))
        })?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::internal(format!("Failed to add publish schedule: {e}")))?;

        info!(schedule, "Registered: outbox publish");
        Ok(())
    }

    /// Start the scheduler.
    pub async fn start(&self) -> AppResult<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {e}")))?;

        info!("Outbox scheduler started");
        Ok(())
    }

    /// Shut the scheduler down.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {e}")))?;

        info!("Outbox scheduler shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couponhub_cache::memory::MemoryMessageBus;
    use couponhub_core::config::OutboxConfig;
    use couponhub_core::error::ErrorKind;
    use couponhub_database::MemoryDatabase;

    #[tokio::test]
    async fn test_invalid_schedule_is_configuration_error() {
        let publisher = Arc::new(OutboxPublisher::new(
            Arc::new(MemoryDatabase::new()),
            Arc::new(MemoryMessageBus::new()),
            OutboxConfig::default(),
        ));
        let scheduler = OutboxScheduler::new(publisher).await.unwrap();
        let err = scheduler.register_publish("not a cron").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
