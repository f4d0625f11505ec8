//! Consumer confirming reservations from `coupon.reserved` events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use couponhub_core::config::{MessageBusConfig, OutboxConfig, WorkerConfig};
use couponhub_core::result::AppResult;
use couponhub_core::traits::{BusSubscription, Delivery, MessageBus};
use couponhub_entity::outbox::CouponReservedPayload;
use couponhub_service::ReservationService;

/// Deliveries of one message after which a failing confirmation is
/// abandoned and acknowledged instead of redelivered.
pub const MAX_DELIVERIES: u32 = 5;

/// Joins the confirmation consumer group and confirms each reservation
/// event it is handed.
///
/// A confirmation that failed for a transient reason is nacked so the bus
/// redelivers it; confirmation is idempotent, so redelivery of an
/// already-confirmed reservation is a no-op that is simply acked. A
/// rejected confirmation is acked at once, the reservation having already
/// been failed and its unit returned. After [`MAX_DELIVERIES`] transient
/// failures the reservation is abandoned the same way.
#[derive(Debug)]
pub struct ReservationConsumer {
    bus: Arc<dyn MessageBus>,
    reservations: Arc<ReservationService>,
    topic: String,
    group: String,
    consumer: String,
    block: Duration,
    idle_backoff: Duration,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Reservation confirmed (or already confirmed); acked.
    Confirmed,
    /// Confirmation failed transiently; nacked for redelivery.
    Redelivered,
    /// Confirmation can never succeed; acked without redelivery.
    Rejected,
    /// Unusable message, or delivery limit reached and the reservation
    /// abandoned; acked.
    Dropped,
}

impl ReservationConsumer {
    /// Create a new consumer.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        reservations: Arc<ReservationService>,
        outbox: &OutboxConfig,
        bus_config: &MessageBusConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            bus,
            reservations,
            topic: outbox.topic.clone(),
            group: bus_config.consumer_group.clone(),
            consumer: worker.worker_id.clone(),
            block: Duration::from_millis(bus_config.block_ms),
            idle_backoff: Duration::from_millis(worker.poll_interval_ms),
        }
    }

    /// Join the consumer group.
    pub async fn subscribe(&self) -> AppResult<Box<dyn BusSubscription>> {
        self.bus
            .subscribe(&self.topic, &self.group, &self.consumer)
            .await
    }

    /// Consume until the cancel signal is received.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> AppResult<()> {
        let mut subscription = self.subscribe().await?;
        info!(topic = %self.topic, group = %self.group, consumer = %self.consumer, "Reservation consumer started");

        loop {
            let polled = tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
                polled = self.poll_once(subscription.as_mut()) => polled,
            };

            if let Err(e) = polled {
                error!(error = %e, "Failed to poll reservation events");
                tokio::time::sleep(self.idle_backoff).await;
            }
        }

        info!(consumer = %self.consumer, "Reservation consumer shut down");
        Ok(())
    }

    /// Wait for one delivery and handle it. Returns `None` when nothing
    /// arrived within the block timeout.
    pub async fn poll_once(
        &self,
        subscription: &mut dyn BusSubscription,
    ) -> AppResult<Option<DeliveryOutcome>> {
        let Some(delivery) = subscription.next(self.block).await? else {
            return Ok(None);
        };
        let outcome = self.handle(&delivery).await;
        match outcome {
            DeliveryOutcome::Redelivered => subscription.nack(&delivery).await?,
            DeliveryOutcome::Confirmed | DeliveryOutcome::Rejected | DeliveryOutcome::Dropped => {
                subscription.ack(&delivery).await?
            }
        }
        Ok(Some(outcome))
    }

    async fn handle(&self, delivery: &Delivery) -> DeliveryOutcome {
        let message = &delivery.message;
        if message.event_type != CouponReservedPayload::EVENT_TYPE {
            warn!(delivery_id = %delivery.id, event_type = %message.event_type, "Ignoring unexpected event type");
            return DeliveryOutcome::Dropped;
        }

        let payload: CouponReservedPayload = match serde_json::from_value(message.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(delivery_id = %delivery.id, error = %e, "Malformed reservation event");
                return DeliveryOutcome::Dropped;
            }
        };

        match self
            .reservations
            .confirm(payload.reservation_id, &payload.idempotency_key)
            .await
        {
            Ok(user_coupon) => {
                debug!(
                    reservation_id = %payload.reservation_id,
                    user_coupon_id = %user_coupon.id,
                    delivery_count = delivery.delivery_count,
                    "Reservation event handled"
                );
                DeliveryOutcome::Confirmed
            }
            Err(e) if e.kind.is_rejection() => {
                warn!(
                    reservation_id = %payload.reservation_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Reservation confirmation rejected"
                );
                DeliveryOutcome::Rejected
            }
            Err(e) if delivery.delivery_count >= MAX_DELIVERIES => {
                error!(
                    reservation_id = %payload.reservation_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Giving up on reservation confirmation"
                );
                let reason = format!("gave up after {} deliveries: {e}", delivery.delivery_count);
                match self
                    .reservations
                    .abandon(payload.reservation_id, &reason)
                    .await
                {
                    Ok(returned) => {
                        info!(reservation_id = %payload.reservation_id, returned, "Reservation abandoned");
                    }
                    Err(abandon_err) => {
                        error!(
                            reservation_id = %payload.reservation_id,
                            error = %abandon_err,
                            "Failed to abandon reservation; left pending for reconciliation"
                        );
                    }
                }
                DeliveryOutcome::Dropped
            }
            Err(e) => {
                warn!(
                    reservation_id = %payload.reservation_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Reservation confirmation failed, requesting redelivery"
                );
                DeliveryOutcome::Redelivered
            }
        }
    }
}
