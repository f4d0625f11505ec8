//! Message bus trait with consumer-group subscriptions.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::result::AppResult;

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Partitioning / deduplication key (the outbox idempotency key).
    pub key: String,
    /// Event type name.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
}

/// A message handed to one consumer of a group.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Bus-assigned delivery identifier, used to ack/nack.
    pub id: String,
    /// The message itself.
    pub message: BusMessage,
    /// How many times this message has been handed out to the group.
    pub delivery_count: u32,
}

/// Trait for topic-based message buses.
#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug + 'static {
    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: &BusMessage) -> AppResult<()>;

    /// Join `group` on `topic` as `consumer`. Messages are load-balanced
    /// across the consumers of a group; every group sees every message.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AppResult<Box<dyn BusSubscription>>;
}

/// A consumer's handle on a group subscription.
#[async_trait]
pub trait BusSubscription: Send + std::fmt::Debug {
    /// Wait up to `wait` for the next delivery.
    async fn next(&mut self, wait: Duration) -> AppResult<Option<Delivery>>;

    /// Acknowledge a delivery so it is never handed out again.
    async fn ack(&mut self, delivery: &Delivery) -> AppResult<()>;

    /// Reject a delivery, leaving it to the bus's redelivery policy.
    async fn nack(&mut self, delivery: &Delivery) -> AppResult<()>;
}
