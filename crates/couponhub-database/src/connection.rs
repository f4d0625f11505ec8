//! PostgreSQL connection pool.

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use couponhub_core::config::DatabaseConfig;
use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;

use crate::repositories::{PgCouponRepository, PgOutboxRepository, PgReservationRepository};

/// Shared sqlx pool plus constructors for the repositories built on it.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Open the pool described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        info!(
            url = %mask_password(&config.url),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| {
                AppError::with_source(
                    ErrorKind::Database,
                    format!("Failed to connect to database: {e}"),
                    e,
                )
            })?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// The underlying sqlx pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> AppResult<()> {
        crate::migration::run_migrations(&self.pool).await
    }

    /// Coupon and user-coupon repository on this pool.
    pub fn coupons(&self) -> PgCouponRepository {
        PgCouponRepository::new(self.pool.clone())
    }

    /// Reservation repository on this pool.
    pub fn reservations(&self) -> PgReservationRepository {
        PgReservationRepository::new(self.pool.clone())
    }

    /// Outbox repository on this pool.
    pub fn outbox(&self) -> PgOutboxRepository {
        PgOutboxRepository::new(self.pool.clone())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> AppResult<bool> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|v| v == 1)
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Health check failed", e))
    }

    /// Close every connection in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

/// Mask the password portion of a database URL for logging.
fn mask_password(url: &str) -> String {
    let Some(at_pos) = url.find('@') else {
        return url.to_string();
    };
    let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
    match url[..at_pos].rfind(':') {
        Some(colon_pos) if colon_pos > scheme_end => {
            format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..])
        }
        _ => url.to_string(),
    }
}
