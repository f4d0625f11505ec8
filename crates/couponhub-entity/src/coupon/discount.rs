//! Discount rule value object.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a coupon's discount value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// A fixed amount off the order.
    Fixed,
    /// A percentage (0-100) off the order.
    Percentage,
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Percentage => write!(f, "percentage"),
        }
    }
}

/// Discount rule attached to a coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DiscountRule {
    /// Fixed amount in minor currency units.
    Fixed(i64),
    /// Percentage of the order amount.
    Percentage(i64),
}

impl DiscountRule {
    /// Build a rule from its persisted columns.
    pub fn from_parts(kind: DiscountType, value: i64) -> Self {
        match kind {
            DiscountType::Fixed => Self::Fixed(value),
            DiscountType::Percentage => Self::Percentage(value),
        }
    }

    /// Split the rule into its persisted columns.
    pub fn into_parts(self) -> (DiscountType, i64) {
        match self {
            Self::Fixed(v) => (DiscountType::Fixed, v),
            Self::Percentage(v) => (DiscountType::Percentage, v),
        }
    }

    /// Whether the rule's value is in range.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Fixed(v) => v > 0,
            Self::Percentage(v) => (1..=100).contains(&v),
        }
    }

    /// Discount granted on an order of `amount`, never more than the amount.
    pub fn discount_for(&self, amount: i64) -> i64 {
        if amount <= 0 {
            return 0;
        }
        let raw = match *self {
            Self::Fixed(v) => v,
            Self::Percentage(pct) => amount * pct / 100,
        };
        raw.clamp(0, amount)
    }
}
