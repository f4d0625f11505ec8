//! Per-user issued coupons.

pub mod model;
pub mod status;

pub use model::UserCoupon;
pub use status::UserCouponStatus;
