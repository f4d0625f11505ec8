//! Coupon and user-coupon repository on PostgreSQL.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_entity::coupon::Coupon;
use couponhub_entity::user_coupon::UserCoupon;

use super::{CouponRepository, map_read_err, map_write_err};

/// PostgreSQL-backed [`CouponRepository`].
#[derive(Debug, Clone)]
pub struct PgCouponRepository {
    pool: PgPool,
}

impl PgCouponRepository {
    /// Create a new coupon repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Versioned (and optionally fenced) update of the coupon counters.
    ///
    /// A zero-row update is diagnosed by re-reading the row: a newer
    /// accepted token is a fencing violation, anything else a version
    /// conflict.
    async fn update_counters(
        tx: &mut Transaction<'_, Postgres>,
        coupon: &Coupon,
        fencing_token: Option<i64>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE coupons SET used_count = $2, version = version + 1, \
             fencing_token = GREATEST(fencing_token, COALESCE($4, fencing_token)), \
             updated_at = $5 \
             WHERE id = $1 AND version = $3 \
             AND ($4::BIGINT IS NULL OR fencing_token <= $4)",
        )
        .bind(coupon.id)
        .bind(coupon.used_count())
        .bind(coupon.version())
        .bind(fencing_token)
        .bind(coupon.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_write_err("Failed to update coupon counters"))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<(i32, i64)> =
            sqlx::query_as("SELECT version, fencing_token FROM coupons WHERE id = $1")
                .bind(coupon.id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_read_err("Failed to read coupon version"))?;

        match (current, fencing_token) {
            (None, _) => Err(AppError::not_found(format!("Coupon {} not found", coupon.id))),
            (Some((_, accepted)), Some(token)) if accepted > token => {
                Err(AppError::fencing_violation(token, accepted))
            }
            (Some((version, _)), _) => Err(AppError::optimistic_lock(format!(
                "Coupon {} was modified concurrently (expected version {}, found {version})",
                coupon.id,
                coupon.version()
            ))),
        }
    }
}

#[async_trait]
impl CouponRepository for PgCouponRepository {
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO coupons (id, code, name, discount_type, discount_value, total_count, \
             used_count, valid_from, valid_until, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(coupon.id)
        .bind(&coupon.code)
        .bind(&coupon.name)
        .bind(coupon.discount_type)
        .bind(coupon.discount_value)
        .bind(coupon.total_count())
        .bind(coupon.used_count())
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(coupon.version())
        .bind(coupon.created_at)
        .bind(coupon.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to insert coupon"))?;
        Ok(())
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_read_err("Failed to find coupon"))
    }

    async fn find_coupon_by_code(&self, code: &str) -> AppResult<Option<Coupon>> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_read_err("Failed to find coupon by code"))
    }

    async fn find_user_coupon(&self, id: Uuid) -> AppResult<Option<UserCoupon>> {
        sqlx::query_as::<_, UserCoupon>("SELECT * FROM user_coupons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_read_err("Failed to find user coupon"))
    }

    async fn find_user_coupon_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<UserCoupon>> {
        sqlx::query_as::<_, UserCoupon>(
            "SELECT * FROM user_coupons WHERE issued_idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_read_err("Failed to find user coupon by idempotency key"))
    }

    async fn has_active_user_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM user_coupons \
             WHERE coupon_id = $1 AND user_id = $2 AND status <> 'cancelled')",
        )
        .bind(coupon_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_read_err("Failed to check active user coupon"))
    }

    async fn save_issuance(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
        fencing_token: Option<i64>,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_read_err("Failed to begin transaction"))?;

        Self::update_counters(&mut tx, coupon, fencing_token).await?;

        sqlx::query(
            "INSERT INTO user_coupons (id, coupon_id, user_id, status, issued_idempotency_key, \
             issued_at, expires_at, used_at, cancelled_at, quota_tracked) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(user_coupon.id)
        .bind(user_coupon.coupon_id)
        .bind(user_coupon.user_id)
        .bind(user_coupon.status)
        .bind(&user_coupon.issued_idempotency_key)
        .bind(user_coupon.issued_at)
        .bind(user_coupon.expires_at)
        .bind(user_coupon.used_at)
        .bind(user_coupon.cancelled_at)
        .bind(user_coupon.quota_tracked)
        .execute(&mut *tx)
        .await
        .map_err(map_write_err("Failed to insert user coupon"))?;

        tx.commit()
            .await
            .map_err(map_write_err("Failed to commit issuance"))?;

        debug!(coupon_id = %coupon.id, user_coupon_id = %user_coupon.id, ?fencing_token, "Issuance persisted");
        Ok(())
    }

    async fn save_cancellation(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_read_err("Failed to begin transaction"))?;

        Self::update_counters(&mut tx, coupon, None).await?;

        let result = sqlx::query(
            "UPDATE user_coupons SET status = $2, cancelled_at = $3 \
             WHERE id = $1 AND status <> 'cancelled'",
        )
        .bind(user_coupon.id)
        .bind(user_coupon.status)
        .bind(user_coupon.cancelled_at)
        .execute(&mut *tx)
        .await
        .map_err(map_write_err("Failed to cancel user coupon"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "User coupon {} is already cancelled",
                user_coupon.id
            )));
        }

        tx.commit()
            .await
            .map_err(map_write_err("Failed to commit cancellation"))?;
        Ok(())
    }

    async fn update_user_coupon(&self, user_coupon: &UserCoupon) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE user_coupons SET status = $2, used_at = $3, cancelled_at = $4 WHERE id = $1",
        )
        .bind(user_coupon.id)
        .bind(user_coupon.status)
        .bind(user_coupon.used_at)
        .bind(user_coupon.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to update user coupon"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "User coupon {} not found",
                user_coupon.id
            )));
        }
        Ok(())
    }
}
