//! # couponhub-entity
//!
//! Domain entity models for CouponHub. Every struct in this crate
//! represents a database table row or a domain value object. All entities
//! derive `Debug`, `Clone`, `Serialize`, `Deserialize`, and database
//! entities additionally derive `sqlx::FromRow`.

pub mod coupon;
pub mod outbox;
pub mod reservation;
pub mod user_coupon;
