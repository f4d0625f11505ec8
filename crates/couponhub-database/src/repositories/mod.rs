//! Persistence ports and their PostgreSQL implementations.
//!
//! The services depend on the traits only. [`crate::MemoryDatabase`]
//! implements all three for tests and single-node runs.

pub mod coupon;
pub mod outbox;
pub mod reservation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_entity::coupon::Coupon;
use couponhub_entity::outbox::OutboxEvent;
use couponhub_entity::reservation::CouponReservation;
use couponhub_entity::user_coupon::UserCoupon;

pub use coupon::PgCouponRepository;
pub use outbox::PgOutboxRepository;
pub use reservation::PgReservationRepository;

/// Coupons and the user coupons issued from them.
#[async_trait]
pub trait CouponRepository: Send + Sync + std::fmt::Debug + 'static {
    /// Insert a new coupon.
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<()>;

    /// Find a coupon by ID.
    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>>;

    /// Find a coupon by its redemption code.
    async fn find_coupon_by_code(&self, code: &str) -> AppResult<Option<Coupon>>;

    /// Find a user coupon by ID.
    async fn find_user_coupon(&self, id: Uuid) -> AppResult<Option<UserCoupon>>;

    /// Find the user coupon issued under an idempotency key.
    async fn find_user_coupon_by_key(&self, idempotency_key: &str)
    -> AppResult<Option<UserCoupon>>;

    /// Whether `user_id` already holds a non-cancelled coupon of `coupon_id`.
    async fn has_active_user_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    /// Persist one issuance atomically: the coupon's new counters (checked
    /// against the coupon's current `version`) and the new user coupon.
    ///
    /// When `fencing_token` is given the write is also rejected with
    /// `FencingTokenViolation` if a newer token was already accepted for
    /// the coupon.
    async fn save_issuance(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
        fencing_token: Option<i64>,
    ) -> AppResult<()>;

    /// Persist one cancellation atomically (version-checked coupon plus
    /// the cancelled user coupon).
    async fn save_cancellation(&self, coupon: &Coupon, user_coupon: &UserCoupon)
    -> AppResult<()>;

    /// Persist a user coupon status change that leaves the coupon untouched.
    async fn update_user_coupon(&self, user_coupon: &UserCoupon) -> AppResult<()>;
}

/// Reservations and their transactional outbox append.
#[async_trait]
pub trait ReservationRepository: Send + Sync + std::fmt::Debug + 'static {
    /// Insert the reservation and its outbox event in one transaction.
    /// A duplicate idempotency key, or a second `PENDING` reservation for
    /// the same `(coupon_id, user_id)`, is a `Conflict`.
    async fn create_with_outbox(
        &self,
        reservation: &CouponReservation,
        event: &OutboxEvent,
    ) -> AppResult<()>;

    /// Find a reservation by ID.
    async fn find_reservation(&self, id: Uuid) -> AppResult<Option<CouponReservation>>;

    /// Find a reservation by idempotency key.
    async fn find_reservation_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<CouponReservation>>;

    /// Whether `user_id` has a `PENDING` reservation of `coupon_id`.
    async fn has_pending_reservation(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    /// Move a reservation from `PENDING` to `CONFIRMED`. Returns `false`
    /// when it was no longer pending.
    async fn mark_confirmed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    /// Move a reservation from `PENDING` to `FAILED`. Returns `true` only
    /// for the single caller that performed the transition.
    async fn fail_reservation(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> AppResult<bool>;

    /// Number of `PENDING` reservations of a coupon.
    async fn count_pending(&self, coupon_id: Uuid) -> AppResult<i64>;
}

/// Event counts per outbox status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    /// Events waiting to be published.
    pub new: i64,
    /// Events claimed by a publisher and not yet settled.
    pub processing: i64,
    /// Events delivered to the bus.
    pub published: i64,
    /// Events whose publish failed.
    pub failed: i64,
}

/// Outbox queue operations.
#[async_trait]
pub trait OutboxRepository: Send + Sync + std::fmt::Debug + 'static {
    /// Up to `limit` `NEW` events, oldest first.
    async fn fetch_new(&self, limit: u32) -> AppResult<Vec<OutboxEvent>>;

    /// Compare-and-set `NEW → PROCESSING`. Returns `true` only for the
    /// single caller that performed the transition.
    async fn claim(&self, id: Uuid) -> AppResult<bool>;

    /// Move a claimed event `PROCESSING → PUBLISHED`. Returns `false` and
    /// changes nothing when the event is not `PROCESSING`.
    async fn mark_published(&self, id: Uuid) -> AppResult<bool>;

    /// Move a claimed event `PROCESSING → FAILED`, incrementing its attempt
    /// counter. Returns `false` and changes nothing when the event is not
    /// `PROCESSING`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool>;

    /// Move `FAILED` events with fewer than `max_attempts` attempts back
    /// to `NEW`. Returns the number of events moved.
    async fn resubmit_failed(&self, max_attempts: i32) -> AppResult<u64>;

    /// Find an event by ID.
    async fn find_event(&self, id: Uuid) -> AppResult<Option<OutboxEvent>>;

    /// Event counts per status.
    async fn stats(&self) -> AppResult<OutboxStats>;
}

/// Map a sqlx error, turning unique-constraint violations into `Conflict`.
pub(crate) fn map_write_err(context: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return AppError::conflict(format!("{context}: {}", db.message()));
            }
        }
        AppError::with_source(ErrorKind::Database, context.to_string(), e)
    }
}

/// Map a sqlx error on a read path.
pub(crate) fn map_read_err(context: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| AppError::with_source(ErrorKind::Database, context.to_string(), e)
}
