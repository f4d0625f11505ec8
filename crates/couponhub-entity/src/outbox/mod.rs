//! Transactional outbox entities.

pub mod model;
pub mod payload;
pub mod status;

pub use model::OutboxEvent;
pub use payload::CouponReservedPayload;
pub use status::OutboxStatus;
