//! # couponhub-service
//!
//! Use cases of the coupon subsystem. Each service orchestrates the
//! persistence ports, the quota counter and the configured lock strategy.
//!
//! Services follow constructor injection: all dependencies are provided
//! at construction time via `Arc` references.

pub mod issuance;
pub mod reconciliation;
pub mod recovery;
pub mod reservation;

pub use issuance::CouponIssuanceService;
pub use reconciliation::{QuotaReconciler, ReconciliationReport};
pub use recovery::CouponRecoveryService;
pub use reservation::ReservationService;
