//! The no-lock strategy: exclusion comes from row versions.

use async_trait::async_trait;

use couponhub_core::result::AppResult;

use super::new_holder_id;
use crate::contract::{DistributedLock, LockLease, LockOptions};

/// Grants every caller immediately. Correctness rests on the versioned
/// write in the repository; a lost race surfaces as `OptimisticLock` and
/// is retried by [`OptimisticRetry`](crate::retry::OptimisticRetry).
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticLock;

#[async_trait]
impl DistributedLock for OptimisticLock {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        Ok(LockLease::new(key, new_holder_id(), options.ttl))
    }

    async fn release(&self, _lease: &LockLease) -> AppResult<()> {
        Ok(())
    }
}
