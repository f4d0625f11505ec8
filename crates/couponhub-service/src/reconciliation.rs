//! Operator-invoked repair of the remaining-count counter.
//!
//! The counter and the relational `used_count` drift apart when a process
//! dies between taking a quota unit and committing (or rolling back) the
//! domain write. Reconciliation recomputes the counter from the database.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_database::{CouponRepository, ReservationRepository};

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Coupon inspected.
    pub coupon_id: Uuid,
    /// `total - used - pending reservations`.
    pub expected: i64,
    /// Counter value before reconciliation, if the counter exists.
    pub actual: Option<i64>,
    /// Whether the counter was rewritten.
    pub applied: bool,
}

impl ReconciliationReport {
    /// `actual - expected`; positive means the counter over-reports.
    /// `None` when the counter does not exist.
    pub fn drift(&self) -> Option<i64> {
        self.actual.map(|actual| actual - self.expected)
    }

    /// Whether the counter disagrees with the database.
    pub fn is_drifted(&self) -> bool {
        self.drift().is_some_and(|d| d != 0)
    }
}

/// Compares the quota counter against the database.
#[derive(Debug, Clone)]
pub struct QuotaReconciler {
    coupons: Arc<dyn CouponRepository>,
    reservations: Arc<dyn ReservationRepository>,
    quota: Arc<dyn QuotaCounter>,
}

impl QuotaReconciler {
    /// Creates a new reconciler.
    pub fn new(
        coupons: Arc<dyn CouponRepository>,
        reservations: Arc<dyn ReservationRepository>,
        quota: Arc<dyn QuotaCounter>,
    ) -> Self {
        Self {
            coupons,
            reservations,
            quota,
        }
    }

    /// Report the counter's drift for `coupon_id`, rewriting the counter
    /// to the expected value only when `apply` is set and it drifted.
    ///
    /// A counter that does not exist is left alone; it is initialized
    /// from the coupon's total on its next use.
    pub async fn reconcile(&self, coupon_id: Uuid, apply: bool) -> AppResult<ReconciliationReport> {
        let coupon = self
            .coupons
            .find_coupon(coupon_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Coupon {coupon_id} not found")))?;
        let pending = self.reservations.count_pending(coupon_id).await?;

        let expected = (i64::from(coupon.remaining()) - pending).max(0);
        let actual = self.quota.remaining(coupon_id).await?;

        let mut report = ReconciliationReport {
            coupon_id,
            expected,
            actual,
            applied: false,
        };

        if !report.is_drifted() {
            info!(coupon_id = %coupon_id, expected, actual = ?actual, "Quota counter consistent");
            return Ok(report);
        }

        warn!(coupon_id = %coupon_id, expected, actual = ?actual, drift = ?report.drift(), "Quota counter drifted");
        if apply {
            self.quota.reset(coupon_id, expected).await?;
            report.applied = true;
            info!(coupon_id = %coupon_id, remaining = expected, "Quota counter rewritten");
        }
        Ok(report)
    }
}
