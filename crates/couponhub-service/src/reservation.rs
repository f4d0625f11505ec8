//! Reserve-then-confirm issuance through the transactional outbox.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_database::{CouponRepository, ReservationRepository};
use couponhub_entity::outbox::OutboxEvent;
use couponhub_entity::reservation::{CouponReservation, ReservationStatus};
use couponhub_entity::user_coupon::UserCoupon;

use crate::issuance::CouponIssuanceService;
use crate::issuance::quota::QuotaHold;

/// Records claims as `PENDING` reservations and turns them into user
/// coupons when the `coupon.reserved` event comes back from the bus.
#[derive(Debug, Clone)]
pub struct ReservationService {
    /// Coupon lookups.
    coupons: Arc<dyn CouponRepository>,
    /// Reservation + outbox persistence.
    reservations: Arc<dyn ReservationRepository>,
    /// Remaining-count counter.
    quota: Arc<dyn QuotaCounter>,
    /// Performs the issuance on confirmation.
    issuance: Arc<CouponIssuanceService>,
}

impl ReservationService {
    /// Creates a new reservation service.
    pub fn new(
        coupons: Arc<dyn CouponRepository>,
        reservations: Arc<dyn ReservationRepository>,
        quota: Arc<dyn QuotaCounter>,
        issuance: Arc<CouponIssuanceService>,
    ) -> Self {
        Self {
            coupons,
            reservations,
            quota,
            issuance,
        }
    }

    /// Reserve one unit of a coupon for a user.
    ///
    /// The unit is taken from the quota counter, then the reservation and
    /// its outbox event are committed together. If that commit fails the
    /// unit is restored. Replaying `idempotency_key` returns the existing
    /// reservation without taking another unit. A user who already holds
    /// the coupon, or has a pending reservation of it under another key,
    /// is refused with `Conflict` before any unit is taken.
    pub async fn reserve(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        coupon_code: &str,
        idempotency_key: &str,
    ) -> AppResult<CouponReservation> {
        if let Some(existing) = self.replayed(coupon_id, user_id, idempotency_key).await? {
            return Ok(existing);
        }

        let coupon = self
            .coupons
            .find_coupon(coupon_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Coupon {coupon_id} not found")))?;
        if coupon.code != coupon_code {
            return Err(AppError::validation(format!(
                "Coupon code '{coupon_code}' does not match coupon {coupon_id}"
            )));
        }
        coupon.ensure_redeemable(Utc::now())?;

        if self
            .reservations
            .has_pending_reservation(coupon_id, user_id)
            .await?
        {
            return Err(AppError::conflict(format!(
                "User {user_id} already has a pending reservation of coupon '{}'",
                coupon.code
            )));
        }
        if self.coupons.has_active_user_coupon(coupon_id, user_id).await? {
            return Err(AppError::conflict(format!(
                "User {user_id} already holds coupon '{}'",
                coupon.code
            )));
        }

        let hold = QuotaHold::take(Arc::clone(&self.quota), &coupon).await?;

        let reservation = CouponReservation::new(coupon_id, user_id, coupon_code, idempotency_key);
        let created = match OutboxEvent::coupon_reserved(&reservation) {
            Ok(event) => {
                self.reservations
                    .create_with_outbox(&reservation, &event)
                    .await
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(()) => {
                hold.keep();
                info!(
                    reservation_id = %reservation.id,
                    coupon_id = %coupon_id,
                    user_id = %user_id,
                    "Coupon reserved"
                );
                Ok(reservation)
            }
            Err(e) => {
                hold.give_back().await;
                if e.is(ErrorKind::Conflict) {
                    // A concurrent call with the same key committed first.
                    if let Some(existing) =
                        self.replayed(coupon_id, user_id, idempotency_key).await?
                    {
                        return Ok(existing);
                    }
                }
                warn!(coupon_id = %coupon_id, user_id = %user_id, error = %e, "Reservation failed");
                Err(e)
            }
        }
    }

    /// Confirm a reservation and issue its user coupon.
    ///
    /// Safe under redelivery: the issuance reuses the reservation's own
    /// idempotency key, so confirming twice yields the same user coupon.
    /// When the issuance is rejected outright (the coupon expired, the
    /// user meanwhile got the coupon another way, ...) the reservation is
    /// moved to `FAILED` and its unit goes back to the quota counter.
    /// Confirming a `FAILED` reservation is a `Conflict`.
    pub async fn confirm(
        &self,
        reservation_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<UserCoupon> {
        let reservation = self.load(reservation_id).await?;

        if reservation.idempotency_key != idempotency_key {
            return Err(AppError::validation(format!(
                "Idempotency key does not match reservation {reservation_id}"
            )));
        }
        if reservation.status == ReservationStatus::Failed {
            return Err(AppError::conflict(format!(
                "Reservation {reservation_id} failed: {}",
                reservation.failure_reason.as_deref().unwrap_or("unknown reason")
            )));
        }

        let issued = self
            .issuance
            .issue_reserved(
                reservation.coupon_id,
                reservation.user_id,
                &reservation.idempotency_key,
            )
            .await;

        let user_coupon = match issued {
            Ok(user_coupon) => user_coupon,
            Err(e) if e.kind.is_rejection() => {
                self.fail(&reservation, &e.message).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let newly_confirmed = self
            .reservations
            .mark_confirmed(reservation_id, Utc::now())
            .await?;
        if !newly_confirmed {
            debug!(reservation_id = %reservation_id, "Reservation already confirmed");
        }

        info!(
            reservation_id = %reservation_id,
            user_coupon_id = %user_coupon.id,
            redelivered = !newly_confirmed,
            "Reservation confirmed"
        );
        Ok(user_coupon)
    }

    /// Give up on confirming a reservation.
    ///
    /// A pending reservation whose user coupon was never written is moved
    /// to `FAILED` and its unit is returned to the quota counter. One whose
    /// user coupon already exists is confirmed instead. Returns whether a
    /// unit was returned.
    pub async fn abandon(&self, reservation_id: Uuid, reason: &str) -> AppResult<bool> {
        let reservation = self.load(reservation_id).await?;
        if reservation.status != ReservationStatus::Pending {
            return Ok(false);
        }

        if self
            .coupons
            .find_user_coupon_by_key(&reservation.idempotency_key)
            .await?
            .is_some()
        {
            self.reservations
                .mark_confirmed(reservation_id, Utc::now())
                .await?;
            info!(reservation_id = %reservation_id, "Abandoned reservation was already issued, confirmed");
            return Ok(false);
        }

        self.fail(&reservation, reason).await
    }

    /// Move a pending reservation to `FAILED` and return its unit. Only the
    /// caller that performed the transition touches the counter.
    async fn fail(&self, reservation: &CouponReservation, reason: &str) -> AppResult<bool> {
        let failed = self
            .reservations
            .fail_reservation(reservation.id, reason, Utc::now())
            .await?;
        if !failed {
            debug!(reservation_id = %reservation.id, "Reservation already settled");
            return Ok(false);
        }

        match self.quota.rollback(reservation.coupon_id).await {
            Ok(remaining) => {
                warn!(
                    reservation_id = %reservation.id,
                    coupon_id = %reservation.coupon_id,
                    remaining = ?remaining,
                    reason,
                    "Reservation failed, quota unit restored"
                );
            }
            Err(e) => {
                error!(
                    reservation_id = %reservation.id,
                    coupon_id = %reservation.coupon_id,
                    error = %e,
                    "Reservation failed but quota unit not restored"
                );
            }
        }
        Ok(true)
    }

    async fn load(&self, reservation_id: Uuid) -> AppResult<CouponReservation> {
        self.reservations
            .find_reservation(reservation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Reservation {reservation_id} not found")))
    }

    async fn replayed(
        &self,
        coupon_id: Uuid,
        user_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<CouponReservation>> {
        let Some(existing) = self
            .reservations
            .find_reservation_by_key(idempotency_key)
            .await?
        else {
            return Ok(None);
        };
        if existing.coupon_id != coupon_id || existing.user_id != user_id {
            return Err(AppError::conflict(format!(
                "Idempotency key '{idempotency_key}' was used for a different reservation"
            )));
        }
        debug!(idempotency_key, reservation_id = %existing.id, "Replayed reservation");
        Ok(Some(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use couponhub_cache::Backends;
    use couponhub_core::config::{LockConfig, LockStrategyKind, RetryConfig};
    use couponhub_database::MemoryDatabase;
    use couponhub_entity::coupon::{Coupon, DiscountRule};
    use couponhub_entity::outbox::{CouponReservedPayload, OutboxStatus};
    use couponhub_lock::{LockManager, LockOptions, OptimisticRetry};
    use std::time::Duration;

    struct Fixture {
        service: ReservationService,
        issuance: Arc<CouponIssuanceService>,
        db: Arc<MemoryDatabase>,
        quota: Arc<dyn QuotaCounter>,
        coupon: Coupon,
    }

    async fn fixture(total: i32) -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let now = Utc::now();
        let coupon = Coupon::new(
            "FLASH50",
            "Flash sale",
            DiscountRule::Percentage(50),
            total,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::days(1),
        )
        .unwrap();
        db.insert_coupon(&coupon).await.unwrap();

        let backends = Backends::in_memory(Duration::from_secs(60), 3);
        let lock = LockManager::new(
            LockStrategyKind::Queue,
            &LockConfig::default(),
            &RetryConfig::default(),
            &backends,
        );
        let issuance = Arc::new(CouponIssuanceService::new(
            db.clone(),
            backends.quota.clone(),
            lock,
            LockOptions::default(),
            OptimisticRetry::default(),
        ));
        let service = ReservationService::new(
            db.clone(),
            db.clone(),
            backends.quota.clone(),
            Arc::clone(&issuance),
        );
        Fixture {
            service,
            issuance,
            db,
            quota: backends.quota,
            coupon,
        }
    }

    #[tokio::test]
    async fn test_reserve_appends_outbox_event() {
        let f = fixture(3).await;
        let user = Uuid::new_v4();
        let reservation = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();

        assert_eq!(reservation.status, ReservationStatus::Pending);
        let events = f.db.outbox_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OutboxStatus::New);
        assert_eq!(events[0].idempotency_key, "order-1");

        let payload: CouponReservedPayload =
            serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload.reservation_id, reservation.id);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_wrong_code_takes_no_unit() {
        let f = fixture(3).await;
        let err = f
            .service
            .reserve(f.coupon.id, Uuid::new_v4(), "WRONG", "order-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exhausted_quota_rejects_reservation() {
        let f = fixture(1).await;
        f.service
            .reserve(f.coupon.id, Uuid::new_v4(), "FLASH50", "order-1")
            .await
            .unwrap();
        let err = f
            .service
            .reserve(f.coupon.id, Uuid::new_v4(), "FLASH50", "order-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CouponExhausted);
        assert_eq!(f.db.outbox_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_reserve_returns_existing() {
        let f = fixture(3).await;
        let user = Uuid::new_v4();
        let first = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();
        let again = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_confirm_rejects_foreign_key() {
        let f = fixture(3).await;
        let reservation = f
            .service
            .reserve(f.coupon.id, Uuid::new_v4(), "FLASH50", "order-1")
            .await
            .unwrap();
        let err = f
            .service
            .confirm(reservation.id, "order-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(f.db.user_coupons_of(f.coupon.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_key_for_same_user_is_conflict() {
        let f = fixture(3).await;
        let user = Uuid::new_v4();
        f.service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();

        let err = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(2));
        assert_eq!(f.db.outbox_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_holder_cannot_reserve_again() {
        let f = fixture(3).await;
        let user = Uuid::new_v4();
        f.issuance
            .issue_with_quota(f.coupon.id, user, "direct-1")
            .await
            .unwrap();

        let err = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_rejected_confirmation_fails_reservation_and_returns_unit() {
        let f = fixture(3).await;
        let user = Uuid::new_v4();
        let reservation = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();
        // The user got the coupon another way before the event came back.
        f.issuance.issue(f.coupon.id, user, "direct-1").await.unwrap();

        let err = f
            .service
            .confirm(reservation.id, "order-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        let stored = f.db.find_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Failed);
        assert!(stored.failure_reason.is_some());
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(3));

        // Redelivery neither issues nor returns the unit twice.
        let err = f
            .service
            .confirm(reservation.id, "order-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(3));
        assert_eq!(f.db.user_coupons_of(f.coupon.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_coupon_is_counter_tracked() {
        let f = fixture(3).await;
        let reservation = f
            .service
            .reserve(f.coupon.id, Uuid::new_v4(), "FLASH50", "order-1")
            .await
            .unwrap();
        let issued = f.service.confirm(reservation.id, "order-1").await.unwrap();

        assert!(issued.quota_tracked);
        let stored = f.db.find_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_abandon_returns_unit_once() {
        let f = fixture(2).await;
        let reservation = f
            .service
            .reserve(f.coupon.id, Uuid::new_v4(), "FLASH50", "order-1")
            .await
            .unwrap();

        assert!(f.service.abandon(reservation.id, "gave up").await.unwrap());
        assert!(!f.service.abandon(reservation.id, "gave up").await.unwrap());
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(2));
        assert_eq!(f.db.count_pending(f.coupon.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandon_after_issuance_confirms_instead() {
        let f = fixture(2).await;
        let user = Uuid::new_v4();
        let reservation = f
            .service
            .reserve(f.coupon.id, user, "FLASH50", "order-1")
            .await
            .unwrap();
        // Issuance committed but the reservation was never marked.
        f.issuance
            .issue_reserved(f.coupon.id, user, "order-1")
            .await
            .unwrap();

        assert!(!f.service.abandon(reservation.id, "gave up").await.unwrap());
        let stored = f.db.find_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
        assert_eq!(f.quota.remaining(f.coupon.id).await.unwrap(), Some(1));
    }
}
