//! # couponhub-database
//!
//! Persistence ports for the coupon aggregates, their PostgreSQL
//! implementations, and an in-memory database used by tests and
//! single-node runs.

pub mod connection;
pub mod memory;
pub mod migration;
pub mod repositories;

pub use connection::DatabasePool;
pub use memory::MemoryDatabase;
pub use repositories::{
    CouponRepository, OutboxRepository, OutboxStats, PgCouponRepository, PgOutboxRepository,
    PgReservationRepository, ReservationRepository,
};
