//! Coupon issuance: the locked path, the quota-counter path, and
//! redemption.

pub(crate) mod quota;
pub mod service;

pub use service::CouponIssuanceService;
