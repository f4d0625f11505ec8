//! Coupon issuance use case.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use couponhub_cache::keys;
use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_database::CouponRepository;
use couponhub_entity::coupon::Coupon;
use couponhub_entity::user_coupon::UserCoupon;
use couponhub_lock::{LockManager, LockOptions, OptimisticRetry};

use super::quota::QuotaHold;

/// Issues user coupons from a coupon's limited stock.
///
/// Two paths enforce the quota:
/// - [`issue`](Self::issue) serializes the read-modify-write of the coupon
///   row behind the configured lock strategy.
/// - [`issue_with_quota`](Self::issue_with_quota) takes a unit from the
///   atomic remaining-count counter first and relies on row versions for
///   the write, restoring the unit if the write fails.
///
/// Both are idempotent per idempotency key: replaying a key returns the
/// user coupon it already produced.
#[derive(Debug, Clone)]
pub struct CouponIssuanceService {
    /// Coupon persistence.
    coupons: Arc<dyn CouponRepository>,
    /// Remaining-count counter.
    quota: Arc<dyn QuotaCounter>,
    /// Configured lock strategy.
    lock: LockManager,
    /// Acquisition limits for the coupon lock.
    options: LockOptions,
    /// Retry policy of the lock-free path.
    retry: OptimisticRetry,
}

impl CouponIssuanceService {
    /// Creates a new issuance service.
    pub fn new(
        coupons: Arc<dyn CouponRepository>,
        quota: Arc<dyn QuotaCounter>,
        lock: LockManager,
        options: LockOptions,
        retry: OptimisticRetry,
    ) -> Self {
        Self {
            coupons,
            quota,
            lock,
            options,
            retry,
        }
    }

    /// The lock strategy guarding [`issue`](Self::issue).
    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Issue one unit of `coupon_id` to `user_id` under the coupon lock.
    pub async fn issue(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<UserCoupon> {
        self.issue_locked(coupon_id, user_id, idempotency_key, false)
            .await
    }

    /// Issue the unit a reservation already took from the quota counter.
    ///
    /// The record is marked as counter-tracked so that recovery gives the
    /// unit back to the counter.
    pub(crate) async fn issue_reserved(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<UserCoupon> {
        self.issue_locked(coupon_id, user_id, idempotency_key, true)
            .await
    }

    async fn issue_locked(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
        quota_tracked: bool,
    ) -> AppResult<UserCoupon> {
        let key = keys::coupon_lock(coupon_id);
        let user_coupon = self
            .lock
            .with_lock(&key, &self.options, |lease| async move {
                self.issue_once(
                    coupon_id,
                    user_id,
                    idempotency_key,
                    lease.fencing_token,
                    quota_tracked,
                )
                .await
            })
            .await?;

        info!(
            coupon_id = %coupon_id,
            user_id = %user_id,
            user_coupon_id = %user_coupon.id,
            strategy = %self.lock.kind(),
            quota_tracked,
            "Coupon issued"
        );
        Ok(user_coupon)
    }

    /// Issue one unit of `coupon_id` to `user_id` without a lock.
    ///
    /// The unit is taken from the remaining-count counter before the
    /// domain write and given back exactly once if the write ultimately
    /// fails, however many optimistic retries it took.
    pub async fn issue_with_quota(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<UserCoupon> {
        if let Some(existing) = self.replayed(coupon_id, user_id, idempotency_key).await? {
            return Ok(existing);
        }

        let coupon = self.load_coupon(coupon_id).await?;
        coupon.ensure_redeemable(Utc::now())?;
        let hold = QuotaHold::take(Arc::clone(&self.quota), &coupon).await?;

        let result = self
            .retry
            .run(|| self.issue_once(coupon_id, user_id, idempotency_key, None, true))
            .await;

        match result {
            Ok(user_coupon) => {
                hold.keep();
                info!(
                    coupon_id = %coupon_id,
                    user_id = %user_id,
                    user_coupon_id = %user_coupon.id,
                    "Coupon issued against quota counter"
                );
                Ok(user_coupon)
            }
            Err(e) => {
                info!(coupon_id = %coupon_id, user_id = %user_id, error = %e, "Issuance failed, restoring quota unit");
                hold.give_back().await;
                Err(e)
            }
        }
    }

    /// Redeem an issued user coupon.
    pub async fn redeem(&self, user_coupon_id: Uuid) -> AppResult<UserCoupon> {
        let mut user_coupon = self
            .coupons
            .find_user_coupon(user_coupon_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("User coupon {user_coupon_id} not found")))?;

        user_coupon.mark_used(Utc::now())?;
        self.coupons.update_user_coupon(&user_coupon).await?;

        info!(user_coupon_id = %user_coupon_id, coupon_id = %user_coupon.coupon_id, "Coupon redeemed");
        Ok(user_coupon)
    }

    /// One read-modify-write of the coupon row.
    async fn issue_once(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
        fencing_token: Option<i64>,
        quota_tracked: bool,
    ) -> AppResult<UserCoupon> {
        if let Some(existing) = self.replayed(coupon_id, user_id, idempotency_key).await? {
            return Ok(existing);
        }

        let mut coupon = self.load_coupon(coupon_id).await?;
        if self.coupons.has_active_user_coupon(coupon_id, user_id).await? {
            return Err(AppError::conflict(format!(
                "User {user_id} already holds coupon '{}'",
                coupon.code
            )));
        }

        let now = Utc::now();
        coupon.issue(now)?;
        let mut user_coupon = UserCoupon::issue(&coupon, user_id, idempotency_key, now);
        if quota_tracked {
            user_coupon = user_coupon.tracked_by_quota();
        }

        match self
            .coupons
            .save_issuance(&coupon, &user_coupon, fencing_token)
            .await
        {
            Ok(()) => {
                debug!(
                    coupon_id = %coupon_id,
                    used = coupon.used_count(),
                    total = coupon.total_count(),
                    token = ?fencing_token,
                    "Issuance persisted"
                );
                Ok(user_coupon)
            }
            // A concurrent call with the same key won the insert.
            Err(e) if e.is(ErrorKind::Conflict) => {
                match self.replayed(coupon_id, user_id, idempotency_key).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The user coupon already issued under `idempotency_key`, if any.
    async fn replayed(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<UserCoupon>> {
        let Some(existing) = self.coupons.find_user_coupon_by_key(idempotency_key).await? else {
            return Ok(None);
        };
        if existing.coupon_id != coupon_id || existing.user_id != user_id {
            return Err(AppError::conflict(format!(
                "Idempotency key '{idempotency_key}' was used for a different issuance"
            )));
        }
        debug!(idempotency_key, user_coupon_id = %existing.id, "Replayed issuance");
        Ok(Some(existing))
    }

    async fn load_coupon(&self, coupon_id: Uuid) -> AppResult<Coupon> {
        self.coupons
            .find_coupon(coupon_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Coupon {coupon_id} not found")))
    }
}
