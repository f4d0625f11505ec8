//! Background processing for the reservation pipeline.
//!
//! This crate provides:
//! - An outbox publisher that claims `NEW` events and sends them to the bus
//! - A cron scheduler that runs the publisher on a fixed tick
//! - A consumer that confirms reservations as their events come back

pub mod consumer;
pub mod publisher;
pub mod scheduler;

pub use consumer::{DeliveryOutcome, MAX_DELIVERIES, ReservationConsumer};
pub use publisher::{OutboxPublisher, PublishReport};
pub use scheduler::OutboxScheduler;
