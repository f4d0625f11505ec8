//! Coupon reservation entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::status::ReservationStatus;

/// Durable intent to issue a coupon, confirmed asynchronously.
///
/// Reservations are never deleted; they anchor idempotency for the
/// confirmation step.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponReservation {
    /// Unique reservation identifier.
    pub id: Uuid,
    /// Reserved coupon.
    pub coupon_id: Uuid,
    /// Reserving user.
    pub user_id: Uuid,
    /// Code the user presented.
    pub coupon_code: String,
    /// Idempotency key of the claim.
    pub idempotency_key: String,
    /// Current status.
    pub status: ReservationStatus,
    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
    /// When the reservation was confirmed.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When confirmation was abandoned.
    pub failed_at: Option<DateTime<Utc>>,
    /// Why confirmation was abandoned.
    pub failure_reason: Option<String>,
}

impl CouponReservation {
    /// Create a pending reservation.
    pub fn new(
        coupon_id: Uuid,
        user_id: Uuid,
        coupon_code: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            coupon_id,
            user_id,
            coupon_code: coupon_code.into(),
            idempotency_key: idempotency_key.into(),
            status: ReservationStatus::Pending,
            created_at: Utc::now(),
            confirmed_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }

    /// Confirm a pending reservation. Returns `false` if it was no longer
    /// pending.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ReservationStatus::Pending {
            return false;
        }
        self.status = ReservationStatus::Confirmed;
        self.confirmed_at = Some(now);
        true
    }

    /// Abandon a pending reservation. Returns `false` if it was no longer
    /// pending, in which case nothing changes.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status != ReservationStatus::Pending {
            return false;
        }
        self.status = ReservationStatus::Failed;
        self.failed_at = Some(now);
        self.failure_reason = Some(reason.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_is_idempotent() {
        let mut r = CouponReservation::new(Uuid::new_v4(), Uuid::new_v4(), "SPRING", "key-1");
        assert_eq!(r.status, ReservationStatus::Pending);
        assert!(r.confirm(Utc::now()));
        let first = r.confirmed_at;
        assert!(!r.confirm(Utc::now()));
        assert_eq!(r.confirmed_at, first);
    }

    #[test]
    fn test_failed_reservation_stays_failed() {
        let mut r = CouponReservation::new(Uuid::new_v4(), Uuid::new_v4(), "SPRING", "key-1");
        assert!(r.fail("coupon expired", Utc::now()));
        assert!(!r.fail("again", Utc::now()));
        assert!(!r.confirm(Utc::now()));

        assert_eq!(r.status, ReservationStatus::Failed);
        assert_eq!(r.failure_reason.as_deref(), Some("coupon expired"));
        assert!(r.confirmed_at.is_none());
    }

    #[test]
    fn test_confirmed_reservation_cannot_fail() {
        let mut r = CouponReservation::new(Uuid::new_v4(), Uuid::new_v4(), "SPRING", "key-1");
        assert!(r.confirm(Utc::now()));
        assert!(!r.fail("late", Utc::now()));
        assert_eq!(r.status, ReservationStatus::Confirmed);
    }
}
