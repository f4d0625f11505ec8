//! Lock whose waiters sleep until the holder announces release.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use couponhub_cache::keys;
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::KeyValueStore;

use super::new_holder_id;
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// Same ownership record as [`SpinLock`](super::SpinLock), but a waiter
/// subscribes to the lock's release channel instead of polling.
///
/// A missed notification costs at most one TTL of waiting: each wait is
/// capped at the lock TTL, after which the waiter tries again.
#[derive(Debug, Clone)]
pub struct PubSubLock {
    store: Arc<dyn KeyValueStore>,
}

impl PubSubLock {
    /// Create a pub/sub lock over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn try_acquire(&self, key: &str, holder: &str, options: &LockOptions) -> AppResult<bool> {
        self.store
            .set_nx(&keys::lock_owner(key), holder, options.ttl)
            .await
    }
}

#[async_trait]
impl DistributedLock for PubSubLock {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        let holder = new_holder_id();
        if self.try_acquire(key, &holder, options).await? {
            return Ok(LockLease::new(key, holder, options.ttl));
        }

        let deadline = Instant::now() + options.wait_timeout;
        let mut releases = self.store.subscribe(&keys::lock_channel(key)).await?;
        let mut wakeups = 0u32;

        loop {
            // Subscribed before this attempt, so a release in between is not lost.
            if self.try_acquire(key, &holder, options).await? {
                debug!(key, wakeups, "Pub/sub lock acquired");
                return Ok(LockLease::new(key, holder, options.ttl));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(key, wakeups, "Pub/sub lock acquisition timed out");
                return Err(AppError::lock_timeout(key, options.wait_timeout));
            }

            let wait = (deadline - now).min(options.ttl);
            match tokio::time::timeout(wait, releases.next()).await {
                Ok(Some(_)) => wakeups += 1,
                Ok(None) => {
                    // Channel closed underneath us; fall back to one fresh subscription.
                    releases = self.store.subscribe(&keys::lock_channel(key)).await?;
                }
                Err(_) => {}
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        let released = self
            .store
            .delete_if_equals(&keys::lock_owner(&lease.key), &lease.holder)
            .await?;
        if released {
            self.store
                .publish(&keys::lock_channel(&lease.key), "released")
                .await?;
        } else {
            warn!(key = %lease.key, holder = %lease.holder, "Lock had already lapsed before release");
        }
        Ok(())
    }
}
