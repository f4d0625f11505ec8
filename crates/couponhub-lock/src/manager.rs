//! Strategy dispatch.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use couponhub_cache::Backends;
use couponhub_core::config::{LockConfig, LockStrategyKind, RetryConfig};
use couponhub_core::result::AppResult;

use crate::contract::{self, DistributedLock, LockLease, LockOptions};
use crate::retry::OptimisticRetry;
use crate::strategy::{FencingLock, OptimisticLock, PubSubLock, QueueLock, QuorumLock, SpinLock};

/// The configured lock strategy.
///
/// Callers use [`LockManager::with_lock`] and stay agnostic to which of
/// the six strategies is behind it.
#[derive(Debug, Clone)]
pub enum LockManager {
    /// No lock; row versions plus whole-operation retry.
    Optimistic(OptimisticLock, OptimisticRetry),
    /// Busy-polling lock.
    Spin(SpinLock),
    /// Release-notification lock.
    PubSub(PubSubLock),
    /// FIFO ticket lock.
    Queue(QueueLock),
    /// Majority lock across independent nodes.
    Quorum(QuorumLock),
    /// Spin lock with fencing tokens.
    Fencing(FencingLock),
}

impl LockManager {
    /// Build the strategy named by `kind` over `backends`.
    pub fn new(
        kind: LockStrategyKind,
        lock: &LockConfig,
        retry: &RetryConfig,
        backends: &Backends,
    ) -> Self {
        let store = Arc::clone(&backends.store);
        match kind {
            LockStrategyKind::Optimistic => {
                Self::Optimistic(OptimisticLock, OptimisticRetry::from_config(retry))
            }
            LockStrategyKind::Spin => Self::Spin(SpinLock::new(store)),
            LockStrategyKind::PubSub => Self::PubSub(PubSubLock::new(store)),
            LockStrategyKind::Queue => Self::Queue(QueueLock::new(store)),
            LockStrategyKind::Quorum => Self::Quorum(QuorumLock::new(
                backends.quorum_nodes.clone(),
                lock.node_timeout(),
            )),
            LockStrategyKind::Fencing => Self::Fencing(FencingLock::new(store)),
        }
    }

    /// Build the strategy selected by `lock.strategy`.
    pub fn from_config(lock: &LockConfig, retry: &RetryConfig, backends: &Backends) -> Self {
        let manager = Self::new(lock.strategy, lock, retry, backends);
        info!(strategy = %manager.kind(), "Lock strategy selected");
        manager
    }

    /// Which strategy this is.
    pub fn kind(&self) -> LockStrategyKind {
        match self {
            Self::Optimistic(..) => LockStrategyKind::Optimistic,
            Self::Spin(_) => LockStrategyKind::Spin,
            Self::PubSub(_) => LockStrategyKind::PubSub,
            Self::Queue(_) => LockStrategyKind::Queue,
            Self::Quorum(_) => LockStrategyKind::Quorum,
            Self::Fencing(_) => LockStrategyKind::Fencing,
        }
    }

    fn strategy(&self) -> &dyn DistributedLock {
        match self {
            Self::Optimistic(inner, _) => inner,
            Self::Spin(inner) => inner,
            Self::PubSub(inner) => inner,
            Self::Queue(inner) => inner,
            Self::Quorum(inner) => inner,
            Self::Fencing(inner) => inner,
        }
    }

    /// Run `f` with exclusive ownership of `key`.
    ///
    /// Under the optimistic strategy there is no ownership; `f` is instead
    /// re-run on `OptimisticLock` conflicts, which is why it must be
    /// callable more than once.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, options: &LockOptions, f: F) -> AppResult<T>
    where
        F: Fn(LockLease) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        match self {
            Self::Optimistic(lock, retry) => {
                retry
                    .run(|| contract::with_lock(lock, key, options, &f))
                    .await
            }
            _ => contract::with_lock(self.strategy(), key, options, f).await,
        }
    }
}

#[async_trait]
impl DistributedLock for LockManager {
    fn name(&self) -> &'static str {
        self.strategy().name()
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
        self.strategy().acquire(key, options).await
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        self.strategy().release(lease).await
    }
}
