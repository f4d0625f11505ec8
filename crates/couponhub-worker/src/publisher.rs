//! Outbox publisher: moves committed events onto the message bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use couponhub_core::config::OutboxConfig;
use couponhub_core::result::AppResult;
use couponhub_core::traits::{BusMessage, MessageBus};
use couponhub_database::{OutboxRepository, OutboxStats};
use couponhub_entity::outbox::OutboxEvent;

/// Counts of one publish pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// `NEW` events fetched.
    pub fetched: usize,
    /// Events sent and marked `PUBLISHED`.
    pub published: usize,
    /// Events whose send failed and were marked `FAILED`.
    pub failed: usize,
    /// Events another publisher claimed first.
    pub skipped: usize,
}

/// Publishes `NEW` outbox events.
///
/// At most one pass runs per publisher at a time; a pass started while
/// another is running returns immediately. Across processes, the
/// compare-and-set claim ensures each event is sent by one publisher only.
#[derive(Debug)]
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn MessageBus>,
    config: OutboxConfig,
    running: AtomicBool,
}

/// Clears the running flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboxPublisher {
    /// Create a new publisher.
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        bus: Arc<dyn MessageBus>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            outbox,
            bus,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Whether a pass is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one publish pass. Returns `None` when a pass was already running.
    pub async fn publish_pending(&self) -> AppResult<Option<PublishReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Publish pass already running, skipping tick");
            return Ok(None);
        }
        let _guard = PassGuard(&self.running);

        let events = self.outbox.fetch_new(self.config.batch_size).await?;
        let mut report = PublishReport {
            fetched: events.len(),
            ..PublishReport::default()
        };

        for event in &events {
            if !self.outbox.claim(event.id).await? {
                debug!(event_id = %event.id, "Outbox event claimed elsewhere");
                report.skipped += 1;
                continue;
            }

            if self.publish_claimed(event).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                "Outbox publish pass completed"
            );
        }
        Ok(Some(report))
    }

    /// Send one claimed event and settle its status. Returns whether the
    /// send succeeded.
    ///
    /// If settling fails the event stays `PROCESSING` and is not sent
    /// again automatically.
    async fn publish_claimed(&self, event: &OutboxEvent) -> bool {
        let message = BusMessage {
            key: event.idempotency_key.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        };

        match self.bus.publish(&self.config.topic, &message).await {
            Ok(()) => {
                match self.outbox.mark_published(event.id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(event_id = %event.id, "Event sent but no longer claimed; status left as is");
                    }
                    Err(e) => {
                        error!(event_id = %event.id, error = %e, "Event sent but not marked published");
                    }
                }
                debug!(event_id = %event.id, topic = %self.config.topic, "Outbox event published");
                true
            }
            Err(e) => {
                warn!(event_id = %event.id, attempts = event.attempts + 1, error = %e, "Outbox publish failed");
                match self.outbox.mark_failed(event.id, &e.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(event_id = %event.id, "Publish failed on an event no longer claimed");
                    }
                    Err(mark_err) => {
                        error!(event_id = %event.id, error = %mark_err, "Failed to record publish failure");
                    }
                }
                false
            }
        }
    }

    /// Move `FAILED` events with fewer than `max_attempts` attempts back to
    /// `NEW` so the next pass picks them up.
    pub async fn resubmit_failed(&self, max_attempts: i32) -> AppResult<u64> {
        let moved = self.outbox.resubmit_failed(max_attempts).await?;
        info!(moved, max_attempts, "Resubmitted failed outbox events");
        Ok(moved)
    }

    /// Event counts per status.
    pub async fn stats(&self) -> AppResult<OutboxStats> {
        self.outbox.stats().await
    }
}
