//! FIFO ticket-queue lock.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use couponhub_cache::keys;
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::KeyValueStore;

use super::{new_holder_id, poll_pause};
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// Waiters append a ticket to the lock's queue and own the lock while
/// their ticket is at the head, so ownership is granted in arrival order.
///
/// Every ticket has a liveness key with the lock TTL, refreshed while its
/// owner is waiting or holding. A head ticket whose liveness key has
/// expired belongs to a crashed waiter and is dropped from the queue.
#[derive(Debug, Clone)]
pub struct QueueLock {
    store: Arc<dyn KeyValueStore>,
}

impl QueueLock {
    /// Create a queue lock over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn leave_queue(&self, key: &str, ticket: &str) -> AppResult<()> {
        self.store.list_remove(&keys::lock_queue(key), ticket).await?;
        self.store.delete(&keys::lock_ticket(key, ticket)).await?;
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for QueueLock {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        let ticket = new_holder_id();
        let queue = keys::lock_queue(key);
        let liveness = keys::lock_ticket(key, &ticket);
        let deadline = Instant::now() + options.wait_timeout;

        self.store.set(&liveness, "waiting", Some(options.ttl)).await?;
        let position = self.store.list_push(&queue, &ticket).await?;
        debug!(key, ticket = %ticket, position, "Joined lock queue");

        loop {
            match self.store.list_head(&queue).await? {
                Some(head) if head == ticket => {
                    self.store.expire(&liveness, options.ttl).await?;
                    debug!(key, ticket = %ticket, "Queue lock acquired");
                    return Ok(LockLease::new(key, ticket, options.ttl));
                }
                Some(head) => {
                    if !self.store.exists(&keys::lock_ticket(key, &head)).await? {
                        info!(key, ticket = %head, "Dropping abandoned ticket from lock queue");
                        self.store.list_remove(&queue, &head).await?;
                        continue;
                    }
                }
                None => {
                    // Queue vanished (e.g. expired); rejoin it.
                    self.store.list_push(&queue, &ticket).await?;
                    continue;
                }
            }

            if Instant::now() >= deadline {
                warn!(key, ticket = %ticket, "Queue lock acquisition timed out");
                self.leave_queue(key, &ticket).await?;
                return Err(AppError::lock_timeout(key, options.wait_timeout));
            }
            if !self.store.expire(&liveness, options.ttl).await? {
                self.store.set(&liveness, "waiting", Some(options.ttl)).await?;
            }
            poll_pause(options.retry_interval, deadline).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        self.leave_queue(&lease.key, &lease.holder).await
    }
}
