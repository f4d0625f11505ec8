//! Core traits defined in `couponhub-core` and implemented by other crates.

pub mod bus;
pub mod quota;
pub mod store;

pub use bus::{BusMessage, BusSubscription, Delivery, MessageBus};
pub use quota::{QuotaCounter, QuotaDecision};
pub use store::{KeyValueStore, Subscription};
