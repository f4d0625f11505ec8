//! # couponhub-core
//!
//! Core crate for CouponHub. Contains the unified error system,
//! configuration schemas, and the backend traits (key/value store,
//! quota counter, message bus) that the infrastructure crates implement.
//!
//! This crate has **no** internal dependencies on other CouponHub crates.

pub mod config;
pub mod error;
pub mod result;
pub mod traits;

pub use error::AppError;
pub use result::AppResult;
