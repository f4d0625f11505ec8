//! User coupon entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;

use super::status::UserCouponStatus;
use crate::coupon::Coupon;

/// One successful issuance of a coupon to a user.
///
/// At most one non-cancelled record exists per `(coupon_id, user_id)`;
/// `issued_idempotency_key` is unique at the persistence boundary.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserCoupon {
    /// Unique record identifier.
    pub id: Uuid,
    /// The coupon this unit was taken from.
    pub coupon_id: Uuid,
    /// The owning user.
    pub user_id: Uuid,
    /// Current status.
    pub status: UserCouponStatus,
    /// Idempotency key of the claim that produced this record.
    pub issued_idempotency_key: String,
    /// When the coupon was issued.
    pub issued_at: DateTime<Utc>,
    /// When the issued coupon stops being redeemable.
    pub expires_at: DateTime<Utc>,
    /// When the coupon was redeemed.
    pub used_at: Option<DateTime<Utc>>,
    /// When the coupon was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Whether the unit was also taken from the quota counter, which then
    /// gets it back on cancellation.
    pub quota_tracked: bool,
}

impl UserCoupon {
    /// Create the record for a unit just taken from `coupon`.
    pub fn issue(
        coupon: &Coupon,
        user_id: Uuid,
        idempotency_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            coupon_id: coupon.id,
            user_id,
            status: UserCouponStatus::Issued,
            issued_idempotency_key: idempotency_key.into(),
            issued_at: now,
            expires_at: coupon.valid_until,
            used_at: None,
            cancelled_at: None,
            quota_tracked: false,
        }
    }

    /// Mark the unit as taken from the quota counter.
    pub fn tracked_by_quota(mut self) -> Self {
        self.quota_tracked = true;
        self
    }

    /// Whether the record still counts against the coupon's quota.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Redeem the coupon.
    pub fn mark_used(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.status != UserCouponStatus::Issued {
            return Err(AppError::conflict(format!(
                "User coupon {} cannot be used from status {}",
                self.id, self.status
            )));
        }
        if now >= self.expires_at {
            return Err(AppError::coupon_expired(format!(
                "User coupon {} expired at {}",
                self.id, self.expires_at
            )));
        }
        self.status = UserCouponStatus::Used;
        self.used_at = Some(now);
        Ok(())
    }

    /// Cancel the coupon (compensation for a failed order).
    pub fn cancel(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.status == UserCouponStatus::Cancelled {
            return Err(AppError::conflict(format!(
                "User coupon {} is already cancelled",
                self.id
            )));
        }
        self.status = UserCouponStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coupon::DiscountRule;
    use chrono::Duration;

    fn issued() -> UserCoupon {
        let now = Utc::now();
        let coupon = Coupon::new(
            "SPRING",
            "Spring sale",
            DiscountRule::Percentage(10),
            10,
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
        .unwrap();
        UserCoupon::issue(&coupon, Uuid::new_v4(), "claim-1", now)
    }

    #[test]
    fn test_use_then_cancel() {
        let mut uc = issued();
        uc.mark_used(Utc::now()).unwrap();
        assert_eq!(uc.status, UserCouponStatus::Used);
        assert!(uc.mark_used(Utc::now()).is_err());
        uc.cancel(Utc::now()).unwrap();
        assert!(!uc.is_active());
    }

    #[test]
    fn test_cancel_twice_conflicts() {
        let mut uc = issued();
        uc.cancel(Utc::now()).unwrap();
        let err = uc.cancel(Utc::now()).unwrap_err();
        assert_eq!(err.kind, couponhub_core::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_cannot_use_after_expiry() {
        let mut uc = issued();
        let later = uc.expires_at + Duration::seconds(1);
        assert!(uc.mark_used(later).is_err());
        assert_eq!(uc.status, UserCouponStatus::Issued);
    }
}
