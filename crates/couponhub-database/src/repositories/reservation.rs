//! Reservation repository on PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use couponhub_core::result::AppResult;
use couponhub_entity::outbox::OutboxEvent;
use couponhub_entity::reservation::CouponReservation;

use super::{ReservationRepository, map_read_err, map_write_err};

/// PostgreSQL-backed [`ReservationRepository`].
#[derive(Debug, Clone)]
pub struct PgReservationRepository {
    pool: PgPool,
}

impl PgReservationRepository {
    /// Create a new reservation repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReservationRepository for PgReservationRepository {
    async fn create_with_outbox(
        &self,
        reservation: &CouponReservation,
        event: &OutboxEvent,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_read_err("Failed to begin transaction"))?;

        sqlx::query(
            "INSERT INTO coupon_reservations (id, coupon_id, user_id, coupon_code, \
             idempotency_key, status, created_at, confirmed_at, failed_at, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(reservation.id)
        .bind(reservation.coupon_id)
        .bind(reservation.user_id)
        .bind(&reservation.coupon_code)
        .bind(&reservation.idempotency_key)
        .bind(reservation.status)
        .bind(reservation.created_at)
        .bind(reservation.confirmed_at)
        .bind(reservation.failed_at)
        .bind(&reservation.failure_reason)
        .execute(&mut *tx)
        .await
        .map_err(map_write_err("Failed to insert reservation"))?;

        sqlx::query(
            "INSERT INTO outbox_events (id, event_type, aggregate_id, payload, idempotency_key, \
             status, attempts, last_error, created_at, updated_at, published_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.aggregate_id)
        .bind(&event.payload)
        .bind(&event.idempotency_key)
        .bind(event.status)
        .bind(event.attempts)
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.published_at)
        .execute(&mut *tx)
        .await
        .map_err(map_write_err("Failed to append outbox event"))?;

        tx.commit()
            .await
            .map_err(map_write_err("Failed to commit reservation"))?;

        debug!(reservation_id = %reservation.id, event_id = %event.id, "Reservation and outbox event committed");
        Ok(())
    }

    async fn find_reservation(&self, id: Uuid) -> AppResult<Option<CouponReservation>> {
        sqlx::query_as::<_, CouponReservation>("SELECT * FROM coupon_reservations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_read_err("Failed to find reservation"))
    }

    async fn find_reservation_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<CouponReservation>> {
        sqlx::query_as::<_, CouponReservation>(
            "SELECT * FROM coupon_reservations WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_read_err("Failed to find reservation by idempotency key"))
    }

    async fn has_pending_reservation(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM coupon_reservations \
             WHERE coupon_id = $1 AND user_id = $2 AND status = 'pending')",
        )
        .bind(coupon_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_read_err("Failed to look up pending reservation"))
    }

    async fn mark_confirmed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE coupon_reservations SET status = 'confirmed', confirmed_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to confirm reservation"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_reservation(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE coupon_reservations SET status = 'failed', failed_at = $2, failure_reason = $3 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to mark reservation failed"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_pending(&self, coupon_id: Uuid) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_reservations WHERE coupon_id = $1 AND status = 'pending'",
        )
        .bind(coupon_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_read_err("Failed to count pending reservations"))
    }
}
