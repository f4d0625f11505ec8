//! Coupon entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;

use super::discount::{DiscountRule, DiscountType};

/// A coupon with a limited number of units.
///
/// `used_count <= total_count` always holds. The counters and the row
/// version are private: they only move through [`Coupon::issue`],
/// [`Coupon::cancel`] and repository writes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    /// Unique coupon identifier.
    pub id: Uuid,
    /// Redemption code shown to users.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Discount kind.
    pub discount_type: DiscountType,
    /// Discount amount or percentage.
    pub discount_value: i64,
    /// Total number of units that may ever be issued.
    total_count: i32,
    /// Units issued and not cancelled.
    used_count: i32,
    /// Start of the validity window.
    pub valid_from: DateTime<Utc>,
    /// End of the validity window.
    pub valid_until: DateTime<Utc>,
    /// Row version for optimistic concurrency control.
    version: i32,
    /// When the coupon was created.
    pub created_at: DateTime<Utc>,
    /// When the coupon was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    /// Create a new coupon with no units issued.
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        rule: DiscountRule,
        total_count: i32,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> AppResult<Self> {
        if total_count <= 0 {
            return Err(AppError::validation("total_count must be positive"));
        }
        if valid_until <= valid_from {
            return Err(AppError::validation("valid_until must be after valid_from"));
        }
        if !rule.is_valid() {
            return Err(AppError::validation(format!("Invalid discount rule: {rule:?}")));
        }

        let (discount_type, discount_value) = rule.into_parts();
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            discount_type,
            discount_value,
            total_count,
            used_count: 0,
            valid_from,
            valid_until,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Total number of units.
    pub fn total_count(&self) -> i32 {
        self.total_count
    }

    /// Units issued and not cancelled.
    pub fn used_count(&self) -> i32 {
        self.used_count
    }

    /// Units still available.
    pub fn remaining(&self) -> i32 {
        self.total_count - self.used_count
    }

    /// Current row version.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// The discount rule.
    pub fn discount_rule(&self) -> DiscountRule {
        DiscountRule::from_parts(self.discount_type, self.discount_value)
    }

    /// Check that `now` falls inside the validity window.
    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> AppResult<()> {
        if now < self.valid_from {
            return Err(AppError::coupon_expired(format!(
                "Coupon '{}' is not valid before {}",
                self.code, self.valid_from
            )));
        }
        if now >= self.valid_until {
            return Err(AppError::coupon_expired(format!(
                "Coupon '{}' expired at {}",
                self.code, self.valid_until
            )));
        }
        Ok(())
    }

    /// Take one unit.
    pub fn issue(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_redeemable(now)?;
        if self.used_count >= self.total_count {
            return Err(AppError::coupon_exhausted(format!(
                "Coupon '{}' has no remaining units ({}/{})",
                self.code, self.used_count, self.total_count
            )));
        }
        self.used_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Give one unit back.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.used_count == 0 {
            return Err(AppError::conflict(format!(
                "Coupon '{}' has no issued units to cancel",
                self.code
            )));
        }
        self.used_count -= 1;
        self.updated_at = now;
        Ok(())
    }

    /// Advance the row version after a successful versioned write.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}
