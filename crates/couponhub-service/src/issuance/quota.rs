//! A decremented quota unit that is given back unless kept.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_entity::coupon::Coupon;

/// One unit taken from a coupon's remaining-count counter.
///
/// Settle it with [`keep`](Self::keep) once the domain write committed or
/// [`give_back`](Self::give_back) when it failed. A hold dropped without
/// being settled (the future was cancelled, or the task panicked) spawns
/// the rollback. The unit is restored at most once either way.
#[derive(Debug)]
pub(crate) struct QuotaHold {
    quota: Arc<dyn QuotaCounter>,
    coupon_id: Uuid,
    settled: bool,
}

impl QuotaHold {
    /// Take one unit of `coupon`, or fail with `CouponExhausted`.
    pub(crate) async fn take(quota: Arc<dyn QuotaCounter>, coupon: &Coupon) -> AppResult<Self> {
        let decision = quota
            .check_and_decrement(coupon.id, i64::from(coupon.total_count()))
            .await?;

        if !decision.success {
            debug!(coupon_id = %coupon.id, issued = decision.issued, "Quota exhausted");
            return Err(AppError::coupon_exhausted(format!(
                "Coupon '{}' has no remaining units ({} issued)",
                coupon.code, decision.issued
            )));
        }

        debug!(coupon_id = %coupon.id, remaining = decision.remaining, "Quota unit taken");
        Ok(Self {
            quota,
            coupon_id: coupon.id,
            settled: false,
        })
    }

    /// The unit is consumed for good.
    pub(crate) fn keep(mut self) {
        self.settled = true;
    }

    /// Restore the unit to the counter.
    pub(crate) async fn give_back(mut self) {
        self.settled = true;
        restore(self.quota.as_ref(), self.coupon_id).await;
    }
}

impl Drop for QuotaHold {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let quota = Arc::clone(&self.quota);
        let coupon_id = self.coupon_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(coupon_id = %coupon_id, "Quota hold dropped unsettled, restoring unit");
                handle.spawn(async move { restore(quota.as_ref(), coupon_id).await });
            }
            Err(_) => {
                error!(coupon_id = %coupon_id, "Quota hold dropped outside a runtime; unit lost until reconciliation");
            }
        }
    }
}

async fn restore(quota: &dyn QuotaCounter, coupon_id: Uuid) {
    match quota.rollback(coupon_id).await {
        Ok(Some(remaining)) => debug!(coupon_id = %coupon_id, remaining, "Quota unit restored"),
        Ok(None) => warn!(coupon_id = %coupon_id, "Quota counter missing, nothing to restore"),
        Err(e) => error!(coupon_id = %coupon_id, error = %e, "Failed to restore quota unit"),
    }
}
