//! Quota counter trait for the atomic remaining-count countdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::AppResult;

/// Outcome of a single check-and-decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Whether a unit was taken.
    pub success: bool,
    /// Units issued so far (`total - remaining`).
    pub issued: i64,
    /// Units still available.
    pub remaining: i64,
}

/// Trait for the per-coupon remaining-count counter.
///
/// Implementations must guarantee atomicity of the whole
/// initialize/check/decrement sequence. Two implementations are provided:
/// - Redis-based (a Lua script executed server-side)
/// - In-memory (a per-key entry lock)
#[async_trait]
pub trait QuotaCounter: Send + Sync + std::fmt::Debug + 'static {
    /// Lazily initialize the counter to `total_count`, then take one unit
    /// if any remain.
    async fn check_and_decrement(&self, coupon_id: Uuid, total_count: i64)
    -> AppResult<QuotaDecision>;

    /// Give one unit back. Returns the new remaining count, or `None` when
    /// the counter was never initialized (nothing to restore).
    async fn rollback(&self, coupon_id: Uuid) -> AppResult<Option<i64>>;

    /// Current remaining count, if the counter exists.
    async fn remaining(&self, coupon_id: Uuid) -> AppResult<Option<i64>>;

    /// Overwrite the remaining count (operator reconciliation).
    async fn reset(&self, coupon_id: Uuid, remaining: i64) -> AppResult<()>;
}
