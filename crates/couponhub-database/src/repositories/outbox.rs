//! Outbox repository on PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use couponhub_core::result::AppResult;
use couponhub_entity::outbox::{OutboxEvent, OutboxStatus};

use super::{OutboxRepository, OutboxStats, map_read_err, map_write_err};

/// PostgreSQL-backed [`OutboxRepository`].
#[derive(Debug, Clone)]
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    /// Create a new outbox repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn fetch_new(&self, limit: u32) -> AppResult<Vec<OutboxEvent>> {
        sqlx::query_as::<_, OutboxEvent>(
            "SELECT * FROM outbox_events WHERE status = 'new' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_read_err("Failed to fetch new outbox events"))
    }

    async fn claim(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'processing', updated_at = NOW() \
             WHERE id = $1 AND status = 'new'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to claim outbox event"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_published(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'published', published_at = NOW(), \
             updated_at = NOW() WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to mark outbox event published"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'failed', attempts = attempts + 1, \
             last_error = $2, updated_at = NOW() WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to mark outbox event failed"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn resubmit_failed(&self, max_attempts: i32) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'new', updated_at = NOW() \
             WHERE status = 'failed' AND attempts < $1",
        )
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(map_write_err("Failed to resubmit failed outbox events"))?;
        Ok(result.rows_affected())
    }

    async fn find_event(&self, id: Uuid) -> AppResult<Option<OutboxEvent>> {
        sqlx::query_as::<_, OutboxEvent>("SELECT * FROM outbox_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_read_err("Failed to find outbox event"))
    }

    async fn stats(&self) -> AppResult<OutboxStats> {
        let rows: Vec<(OutboxStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(map_read_err("Failed to count outbox events"))?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            match status {
                OutboxStatus::New => stats.new = count,
                OutboxStatus::Processing => stats.processing = count,
                OutboxStatus::Published => stats.published = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}
