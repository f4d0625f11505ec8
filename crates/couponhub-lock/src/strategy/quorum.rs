//! Majority lock across independent stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use couponhub_cache::keys;
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::KeyValueStore;

use super::{new_holder_id, poll_pause};
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// Fixed part of the clock-drift allowance subtracted from validity.
const DRIFT_FLOOR: Duration = Duration::from_millis(2);

/// Holds the lock when a strict majority of independent nodes accepted
/// the same holder identity within one round.
///
/// Each node is given at most `node_timeout` per operation so a dead
/// node cannot stall a round. The lease is valid for the TTL minus the
/// time the round took minus a drift allowance; a round whose validity
/// is not positive counts as a failure.
#[derive(Debug, Clone)]
pub struct QuorumLock {
    nodes: Vec<Arc<dyn KeyValueStore>>,
    node_timeout: Duration,
}

impl QuorumLock {
    /// Create a quorum lock over `nodes`.
    pub fn new(nodes: Vec<Arc<dyn KeyValueStore>>, node_timeout: Duration) -> Self {
        Self {
            nodes,
            node_timeout,
        }
    }

    /// Number of nodes that must accept a holder.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    fn drift(ttl: Duration) -> Duration {
        ttl / 100 + DRIFT_FLOOR
    }

    async fn lock_nodes(&self, owner_key: &str, holder: &str, ttl: Duration) -> usize {
        let attempts = self.nodes.iter().map(|node| async move {
            matches!(
                tokio::time::timeout(self.node_timeout, node.set_nx(owner_key, holder, ttl)).await,
                Ok(Ok(true))
            )
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    async fn unlock_nodes(&self, owner_key: &str, holder: &str) -> usize {
        let releases = self.nodes.iter().map(|node| async move {
            matches!(
                tokio::time::timeout(self.node_timeout, node.delete_if_equals(owner_key, holder))
                    .await,
                Ok(Ok(true))
            )
        });
        join_all(releases).await.into_iter().filter(|ok| *ok).count()
    }
}

#[async_trait]
impl DistributedLock for QuorumLock {
    fn name(&self) -> &'static str {
        "quorum"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        if self.nodes.is_empty() {
            return Err(AppError::configuration("Quorum lock has no nodes"));
        }

        let owner_key = keys::lock_owner(key);
        let deadline = Instant::now() + options.wait_timeout;
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            let holder = new_holder_id();
            let started = Instant::now();
            let granted = self.lock_nodes(&owner_key, &holder, options.ttl).await;
            let validity = options
                .ttl
                .saturating_sub(started.elapsed())
                .saturating_sub(Self::drift(options.ttl));

            if granted >= self.quorum() && !validity.is_zero() {
                debug!(key, granted, nodes = self.nodes.len(), rounds, validity_ms = validity.as_millis() as u64, "Quorum lock acquired");
                return Ok(LockLease::new(key, holder, validity));
            }

            // Partial grants would block other contenders until TTL.
            self.unlock_nodes(&owner_key, &holder).await;
            debug!(key, granted, quorum = self.quorum(), rounds, "Quorum round failed");

            if Instant::now() >= deadline {
                warn!(key, rounds, "Quorum lock acquisition timed out");
                return Err(AppError::lock_timeout(key, options.wait_timeout));
            }
            poll_pause(options.retry_interval, deadline).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        let released = self
            .unlock_nodes(&keys::lock_owner(&lease.key), &lease.holder)
            .await;
        if released < self.quorum() {
            warn!(key = %lease.key, released, quorum = self.quorum(), "Quorum lock released on a minority of nodes");
        }
        Ok(())
    }
}
