//! User coupon status enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an issued coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_coupon_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserCouponStatus {
    /// Issued and not yet redeemed.
    Issued,
    /// Redeemed against an order.
    Used,
    /// Cancelled; the unit went back to the coupon.
    Cancelled,
}

impl UserCouponStatus {
    /// Whether the record still counts against the coupon's quota.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Used => "used",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UserCouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
