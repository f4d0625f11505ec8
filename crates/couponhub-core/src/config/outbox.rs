//! Outbox publisher and message bus configuration.

use serde::{Deserialize, Serialize};

/// Outbox publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum number of `NEW` events fetched per publish pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Cron expression for the publish tick (seconds resolution).
    #[serde(default = "default_publish_schedule")]
    pub publish_schedule: String,
    /// Bus topic that reservation events are published to.
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            publish_schedule: default_publish_schedule(),
            topic: default_topic(),
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    /// Bus provider: `"memory"` or `"redis"` (Redis Streams).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis URL when the provider is `"redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Consumer group that confirms reservations.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// How long a consumer blocks waiting for a delivery, in milliseconds.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redis_url: default_redis_url(),
            consumer_group: default_consumer_group(),
            block_ms: default_block_ms(),
        }
    }
}

fn default_batch_size() -> u32 {
    100
}

fn default_publish_schedule() -> String {
    "*/1 * * * * *".to_string()
}

fn default_topic() -> String {
    "coupon.reserved".to_string()
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_consumer_group() -> String {
    "coupon-confirmation".to_string()
}

fn default_block_ms() -> u64 {
    1000
}
