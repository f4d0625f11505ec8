//! # couponhub-cache
//!
//! Backend implementations for CouponHub. Each concern ships a Redis
//! variant for multi-node deployments and an in-memory variant for
//! single-node use and tests:
//!
//! - **key/value store** used by the lock strategies
//! - **quota counter** (atomic remaining-count countdown)
//! - **message bus** (Redis Streams consumer groups)
//!
//! The backend is selected at runtime based on configuration.

pub mod keys;
pub mod memory;
pub mod provider;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod script;

pub use provider::Backends;
