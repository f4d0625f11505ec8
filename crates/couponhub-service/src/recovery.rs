//! Compensating action for a failed order.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use couponhub_cache::keys;
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_database::CouponRepository;
use couponhub_entity::user_coupon::UserCoupon;
use couponhub_lock::{LockManager, LockOptions};

/// Undoes an issuance when the order that consumed it failed downstream.
#[derive(Debug, Clone)]
pub struct CouponRecoveryService {
    coupons: Arc<dyn CouponRepository>,
    quota: Arc<dyn QuotaCounter>,
    lock: LockManager,
    options: LockOptions,
}

impl CouponRecoveryService {
    /// Creates a new recovery service.
    pub fn new(
        coupons: Arc<dyn CouponRepository>,
        quota: Arc<dyn QuotaCounter>,
        lock: LockManager,
        options: LockOptions,
    ) -> Self {
        Self {
            coupons,
            quota,
            lock,
            options,
        }
    }

    /// Cancel a user coupon and give its unit back.
    ///
    /// The cancellation and the coupon's `used_count` decrement commit
    /// together under the same lock as issuance. If the unit was taken
    /// from the quota counter it is then given back there too; a failure
    /// there is logged and left to reconciliation. Units issued under the
    /// lock alone never touched the counter and leave it as is.
    /// Recovering an already cancelled coupon is a `Conflict`.
    pub async fn recover(&self, user_coupon_id: Uuid) -> AppResult<UserCoupon> {
        let user_coupon = self
            .coupons
            .find_user_coupon(user_coupon_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("User coupon {user_coupon_id} not found")))?;
        let coupon_id = user_coupon.coupon_id;

        let cancelled = self
            .lock
            .with_lock(&keys::coupon_lock(coupon_id), &self.options, |_| async move {
                let mut user_coupon = self
                    .coupons
                    .find_user_coupon(user_coupon_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::not_found(format!("User coupon {user_coupon_id} not found"))
                    })?;
                let mut coupon = self
                    .coupons
                    .find_coupon(coupon_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("Coupon {coupon_id} not found")))?;

                let now = Utc::now();
                user_coupon.cancel(now)?;
                coupon.cancel(now)?;
                self.coupons.save_cancellation(&coupon, &user_coupon).await?;
                Ok(user_coupon)
            })
            .await?;

        if !cancelled.quota_tracked {
            info!(user_coupon_id = %user_coupon_id, coupon_id = %coupon_id, "Coupon recovered");
            return Ok(cancelled);
        }

        match self.quota.rollback(coupon_id).await {
            Ok(Some(remaining)) => {
                info!(user_coupon_id = %user_coupon_id, coupon_id = %coupon_id, remaining, "Coupon recovered, quota unit restored");
            }
            Ok(None) => {
                info!(user_coupon_id = %user_coupon_id, coupon_id = %coupon_id, "Coupon recovered, quota counter not tracked");
            }
            Err(e) => {
                warn!(user_coupon_id = %user_coupon_id, coupon_id = %coupon_id, error = %e, "Coupon recovered but quota unit not restored");
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use couponhub_cache::Backends;
    use couponhub_core::config::{LockConfig, LockStrategyKind, RetryConfig};
    use couponhub_core::error::ErrorKind;
    use couponhub_database::MemoryDatabase;
    use couponhub_entity::coupon::{Coupon, DiscountRule};
    use couponhub_entity::user_coupon::UserCouponStatus;
    use couponhub_lock::OptimisticRetry;
    use std::time::Duration;

    use crate::CouponIssuanceService;

    async fn setup() -> (CouponIssuanceService, CouponRecoveryService, Arc<MemoryDatabase>, Coupon) {
        let db = Arc::new(MemoryDatabase::new());
        let now = Utc::now();
        let coupon = Coupon::new(
            "RECOVER",
            "Recoverable",
            DiscountRule::Fixed(100),
            1,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::days(1),
        )
        .unwrap();
        db.insert_coupon(&coupon).await.unwrap();

        let backends = Backends::in_memory(Duration::from_secs(60), 3);
        let lock = LockManager::new(
            LockStrategyKind::Fencing,
            &LockConfig::default(),
            &RetryConfig::default(),
            &backends,
        );
        let issuance = CouponIssuanceService::new(
            db.clone(),
            backends.quota.clone(),
            lock.clone(),
            LockOptions::default(),
            OptimisticRetry::default(),
        );
        let recovery =
            CouponRecoveryService::new(db.clone(), backends.quota.clone(), lock, LockOptions::default());
        (issuance, recovery, db, coupon)
    }

    #[tokio::test]
    async fn test_recovered_unit_can_be_issued_again() {
        let (issuance, recovery, db, coupon) = setup().await;

        let issued = issuance
            .issue_with_quota(coupon.id, Uuid::new_v4(), "order-1")
            .await
            .unwrap();
        let cancelled = recovery.recover(issued.id).await.unwrap();
        assert_eq!(cancelled.status, UserCouponStatus::Cancelled);
        assert_eq!(db.find_coupon(coupon.id).await.unwrap().unwrap().used_count(), 0);

        issuance
            .issue_with_quota(coupon.id, Uuid::new_v4(), "order-2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recovering_twice_is_conflict() {
        let (issuance, recovery, db, coupon) = setup().await;

        let issued = issuance
            .issue(coupon.id, Uuid::new_v4(), "order-1")
            .await
            .unwrap();
        recovery.recover(issued.id).await.unwrap();
        let err = recovery.recover(issued.id).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(db.find_coupon(coupon.id).await.unwrap().unwrap().used_count(), 0);
    }

    #[tokio::test]
    async fn test_locked_issuance_leaves_counter_alone() {
        let (issuance, recovery, _db, coupon) = setup().await;

        // Initializes the counter at 1 and takes its only unit.
        let counted = issuance
            .issue_with_quota(coupon.id, Uuid::new_v4(), "order-1")
            .await
            .unwrap();
        recovery.recover(counted.id).await.unwrap();
        let locked = issuance
            .issue(coupon.id, Uuid::new_v4(), "order-2")
            .await
            .unwrap();
        recovery.recover(locked.id).await.unwrap();

        assert_eq!(remaining(&recovery, coupon.id).await, Some(1));
    }

    async fn remaining(recovery: &CouponRecoveryService, coupon_id: Uuid) -> Option<i64> {
        recovery.quota.remaining(coupon_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_user_coupon_is_not_found() {
        let (_issuance, recovery, _db, _coupon) = setup().await;
        let err = recovery.recover(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
