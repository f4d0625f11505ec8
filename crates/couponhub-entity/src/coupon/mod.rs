//! Coupon aggregate.

pub mod discount;
pub mod model;

pub use discount::{DiscountRule, DiscountType};
pub use model::Coupon;
