//! Outbox event entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use couponhub_core::result::AppResult;

use super::payload::CouponReservedPayload;
use super::status::OutboxStatus;
use crate::reservation::CouponReservation;

/// An event written in the same transaction as the change it describes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Identifier of the aggregate the event describes.
    pub aggregate_id: Uuid,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Idempotency key carried to consumers.
    pub idempotency_key: String,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Failed publish attempts.
    pub attempts: i32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// When the event was written.
    pub created_at: DateTime<Utc>,
    /// When the event was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the event reached the bus.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build the `coupon.reserved` event for a new reservation.
    pub fn coupon_reserved(reservation: &CouponReservation) -> AppResult<Self> {
        let payload = CouponReservedPayload {
            reservation_id: reservation.id,
            coupon_id: reservation.coupon_id,
            user_id: reservation.user_id,
            coupon_code: reservation.coupon_code.clone(),
            idempotency_key: reservation.idempotency_key.clone(),
        };
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: CouponReservedPayload::EVENT_TYPE.to_string(),
            aggregate_id: reservation.id,
            payload: serde_json::to_value(&payload)?,
            idempotency_key: reservation.idempotency_key.clone(),
            status: OutboxStatus::New,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            published_at: None,
        })
    }

    /// Claim the event for publishing. Only succeeds from `New`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::New {
            return false;
        }
        self.status = OutboxStatus::Processing;
        self.updated_at = now;
        true
    }

    /// Mark the claimed event as successfully published. Only succeeds
    /// from `Processing`.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Processing {
            return false;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Mark the claimed event as failed with an error. Only succeeds from
    /// `Processing`.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Processing {
            return false;
        }
        self.status = OutboxStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> OutboxEvent {
        let reservation =
            CouponReservation::new(Uuid::new_v4(), Uuid::new_v4(), "SPRING", "claim-42");
        OutboxEvent::coupon_reserved(&reservation).unwrap()
    }

    #[test]
    fn test_coupon_reserved_payload() {
        let e = event();
        assert_eq!(e.status, OutboxStatus::New);
        assert_eq!(e.idempotency_key, "claim-42");
        let payload: CouponReservedPayload = serde_json::from_value(e.payload.clone()).unwrap();
        assert_eq!(payload.reservation_id, e.aggregate_id);
    }

    #[test]
    fn test_claim_only_from_new() {
        let mut e = event();
        assert!(e.claim(Utc::now()));
        assert!(!e.claim(Utc::now()));
        assert_eq!(e.status, OutboxStatus::Processing);
    }

    #[test]
    fn test_mark_failed_records_error() {
        let mut e = event();
        e.claim(Utc::now());
        assert!(e.mark_failed("Connection timeout", Utc::now()));
        assert_eq!(e.status, OutboxStatus::Failed);
        assert_eq!(e.attempts, 1);
        assert_eq!(e.last_error.as_deref(), Some("Connection timeout"));
    }

    #[test]
    fn test_settling_requires_claim() {
        let mut e = event();
        assert!(!e.mark_published(Utc::now()));
        assert!(!e.mark_failed("late", Utc::now()));
        assert_eq!(e.status, OutboxStatus::New);
        assert_eq!(e.attempts, 0);

        e.claim(Utc::now());
        assert!(e.mark_published(Utc::now()));
        assert!(!e.mark_failed("late", Utc::now()));
        assert_eq!(e.status, OutboxStatus::Published);
    }
}
