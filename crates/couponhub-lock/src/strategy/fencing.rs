//! Spin lock that hands out monotonic fencing tokens.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use couponhub_cache::keys;
use couponhub_core::result::AppResult;
use couponhub_core::traits::KeyValueStore;

use super::SpinLock;
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// After acquiring through a [`SpinLock`], increments the lock's fencing
/// counter and attaches the value to the lease.
///
/// Tokens strictly increase across acquisitions of a key, so a protected
/// resource that remembers the highest token it accepted can reject
/// writes from a holder whose lease lapsed while it was paused.
#[derive(Debug, Clone)]
pub struct FencingLock {
    inner: SpinLock,
}

impl FencingLock {
    /// Create a fencing lock over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: SpinLock::new(store),
        }
    }
}

#[async_trait]
impl DistributedLock for FencingLock {
    fn name(&self) -> &'static str {
        "fencing"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        let mut lease = self.inner.acquire(key, options).await?;
        match self.inner.store().incr(&keys::fencing_counter(key)).await {
            Ok(token) => {
                debug!(key, token, "Fencing token issued");
                lease.fencing_token = Some(token);
                Ok(lease)
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to issue fencing token, releasing lock");
                self.inner.release(&lease).await?;
                Err(e)
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        self.inner.release(lease).await
    }
}
