//! Backend set selected from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use couponhub_core::config::{CacheConfig, LockConfig, MessageBusConfig, QuotaConfig};
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::{KeyValueStore, MessageBus, QuotaCounter};

use crate::memory::{MemoryMessageBus, MemoryQuotaCounter, MemoryStore};

/// Number of independent in-memory stores used for quorum locking when
/// no nodes are configured.
const DEFAULT_MEMORY_QUORUM_NODES: usize = 3;

/// Every backend the coupon subsystem needs.
///
/// The providers are selected at construction time based on configuration.
#[derive(Debug, Clone)]
pub struct Backends {
    /// Key/value store used by the single-store lock strategies.
    pub store: Arc<dyn KeyValueStore>,
    /// Per-coupon remaining-count counter.
    pub quota: Arc<dyn QuotaCounter>,
    /// Message bus carrying outbox events.
    pub bus: Arc<dyn MessageBus>,
    /// Independent stores used by the quorum lock.
    pub quorum_nodes: Vec<Arc<dyn KeyValueStore>>,
}

impl Backends {
    /// Build the backends from configuration.
    pub async fn new(
        cache: &CacheConfig,
        lock: &LockConfig,
        quota: &QuotaConfig,
        bus: &MessageBusConfig,
    ) -> AppResult<Self> {
        let (store, counter, quorum_nodes): (
            Arc<dyn KeyValueStore>,
            Arc<dyn QuotaCounter>,
            Vec<Arc<dyn KeyValueStore>>,
        ) = match cache.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis store and quota counter");
                let client =
                    crate::redis::RedisClient::connect(&cache.redis.url, &cache.redis.key_prefix)
                        .await?;
                let store: Arc<dyn KeyValueStore> =
                    Arc::new(crate::redis::RedisStore::new(client.clone()));
                let counter: Arc<dyn QuotaCounter> =
                    Arc::new(crate::redis::RedisQuotaCounter::new(client, quota.ttl()));

                let mut nodes: Vec<Arc<dyn KeyValueStore>> = Vec::new();
                for url in &lock.quorum_nodes {
                    let node =
                        crate::redis::RedisClient::connect(url, &cache.redis.key_prefix).await?;
                    nodes.push(Arc::new(crate::redis::RedisStore::new(node)));
                }
                if nodes.is_empty() {
                    nodes.push(Arc::clone(&store));
                }
                (store, counter, nodes)
            }
            "memory" => {
                info!("Initializing in-memory store and quota counter");
                let node_count = if lock.quorum_nodes.is_empty() {
                    DEFAULT_MEMORY_QUORUM_NODES
                } else {
                    lock.quorum_nodes.len()
                };
                let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
                let counter: Arc<dyn QuotaCounter> =
                    Arc::new(MemoryQuotaCounter::new(quota.ttl()));
                (store, counter, memory_nodes(node_count))
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown cache provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        let bus: Arc<dyn MessageBus> = match bus.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis Streams message bus");
                let client = crate::redis::RedisClient::connect(&bus.redis_url, "").await?;
                Arc::new(crate::redis::RedisStreamBus::new(client))
            }
            "memory" => {
                info!("Initializing in-memory message bus");
                Arc::new(MemoryMessageBus::new())
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown message bus provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        Ok(Self {
            store,
            quota: counter,
            bus,
            quorum_nodes,
        })
    }

    /// Fully in-memory backends (for testing and single-node runs).
    pub fn in_memory(quota_ttl: Duration, quorum_nodes: usize) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            quota: Arc::new(MemoryQuotaCounter::new(quota_ttl)),
            bus: Arc::new(MemoryMessageBus::new()),
            quorum_nodes: memory_nodes(quorum_nodes),
        }
    }
}

fn memory_nodes(count: usize) -> Vec<Arc<dyn KeyValueStore>> {
    (0..count)
        .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provider_builds_default_quorum() {
        let backends = Backends::new(
            &CacheConfig::default(),
            &LockConfig::default(),
            &QuotaConfig::default(),
            &MessageBusConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(backends.quorum_nodes.len(), DEFAULT_MEMORY_QUORUM_NODES);
        assert!(backends.store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let cache = CacheConfig {
            provider: "memcached".to_string(),
            ..CacheConfig::default()
        };
        let err = Backends::new(
            &cache,
            &LockConfig::default(),
            &QuotaConfig::default(),
            &MessageBusConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, couponhub_core::error::ErrorKind::Configuration);
    }
}
