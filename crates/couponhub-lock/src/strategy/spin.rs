//! Busy-polling lock on a single store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use couponhub_cache::keys;
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::KeyValueStore;

use super::{new_holder_id, poll_pause};
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// `SET NX` with a TTL, retried after a jittered pause until the wait
/// deadline. Release is a compare-and-delete on the holder identity.
#[derive(Debug, Clone)]
pub struct SpinLock {
    store: Arc<dyn KeyValueStore>,
}

impl SpinLock {
    /// Create a spin lock over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// One acquisition attempt. Returns the lease on success.
    pub(crate) async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        options: &LockOptions,
    ) -> AppResult<Option<LockLease>> {
        let acquired = self
            .store
            .set_nx(&keys::lock_owner(key), holder, options.ttl)
            .await?;
        Ok(acquired.then(|| LockLease::new(key, holder.to_string(), options.ttl)))
    }

    /// The store this lock writes to.
    pub(crate) fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }
}

#[async_trait]
impl DistributedLock for SpinLock {
    fn name(&self) -> &'static str {
        "spin"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        let holder = new_holder_id();
        let deadline = Instant::now() + options.wait_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(lease) = self.try_acquire(key, &holder, options).await? {
                debug!(key, attempts, "Spin lock acquired");
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                warn!(key, attempts, "Spin lock acquisition timed out");
                return Err(AppError::lock_timeout(key, options.wait_timeout));
            }
            poll_pause(options.retry_interval, deadline).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        let released = self
            .store
            .delete_if_equals(&keys::lock_owner(&lease.key), &lease.holder)
            .await?;
        if !released {
            warn!(key = %lease.key, holder = %lease.holder, "Lock had already lapsed before release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couponhub_cache::memory::MemoryStore;
    use couponhub_core::error::ErrorKind;
    use std::time::Duration;

    fn options(wait_ms: u64) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(5),
            wait_timeout: Duration::from_millis(wait_ms),
            retry_interval: Duration::from_millis(5),
            hold_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let lock = SpinLock::new(Arc::new(MemoryStore::new()));
        let _held = lock.acquire("k", &options(50)).await.unwrap();
        let err = lock.acquire("k", &options(30)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockTimeout);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let lock = SpinLock::new(Arc::new(MemoryStore::new()));
        let held = lock.acquire("k", &options(50)).await.unwrap();

        let waiter = lock.clone();
        let handle = tokio::spawn(async move { waiter.acquire("k", &options(1_000)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release(&held).await.unwrap();

        let lease = handle.await.unwrap().unwrap();
        assert_ne!(lease.holder, held.holder);
    }

    #[tokio::test]
    async fn test_stale_release_does_not_steal() {
        let store = Arc::new(MemoryStore::new());
        let lock = SpinLock::new(store.clone());
        let short = LockOptions {
            ttl: Duration::from_millis(10),
            ..options(50)
        };
        let stale = lock.acquire("k", &short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = lock.acquire("k", &options(50)).await.unwrap();

        lock.release(&stale).await.unwrap();
        assert_eq!(
            store.get(&keys::lock_owner("k")).await.unwrap().as_deref(),
            Some(current.holder.as_str())
        );
    }
}
