//! The lock contract shared by every strategy.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use couponhub_core::config::LockConfig;
use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;

/// Per-call acquisition and hold limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lifetime of the lock key; ownership lapses after it even if the
    /// holder never releases.
    pub ttl: Duration,
    /// How long acquisition may take before failing with `LockTimeout`.
    pub wait_timeout: Duration,
    /// Base sleep between polling attempts.
    pub retry_interval: Duration,
    /// Upper bound on how long the protected operation may run. When it
    /// elapses the operation is dropped and the lock released.
    pub hold_timeout: Option<Duration>,
}

impl LockOptions {
    /// Options taken from the `[lock]` configuration section.
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            ttl: config.ttl(),
            wait_timeout: config.wait_timeout(),
            retry_interval: config.retry_interval(),
            hold_timeout: None,
        }
    }

    /// Bound the protected operation's run time.
    pub fn with_hold_timeout(mut self, hold_timeout: Duration) -> Self {
        self.hold_timeout = Some(hold_timeout);
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

/// Proof of ownership handed to the protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Logical lock key (e.g. `coupon:lock:<id>`).
    pub key: String,
    /// Random identity of this holder; release only succeeds while the
    /// stored identity still matches.
    pub holder: String,
    /// Monotonic token for the fencing strategy, `None` otherwise.
    pub fencing_token: Option<i64>,
    /// When ownership was obtained.
    pub acquired_at: Instant,
    /// How long ownership is guaranteed from `acquired_at`.
    pub validity: Duration,
}

impl LockLease {
    /// Create a lease acquired now.
    pub fn new(key: &str, holder: String, validity: Duration) -> Self {
        Self {
            key: key.to_string(),
            holder,
            fencing_token: None,
            acquired_at: Instant::now(),
            validity,
        }
    }

    /// Whether the guaranteed ownership window has passed.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.validity
    }
}

/// A mutual-exclusion strategy over a lock key.
#[async_trait]
pub trait DistributedLock: Send + Sync + std::fmt::Debug {
    /// Strategy name used in logs.
    fn name(&self) -> &'static str;

    /// Obtain exclusive ownership of `key`, or fail with `LockTimeout`
    /// once `options.wait_timeout` has elapsed.
    async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease>;

    /// Give up ownership. Releasing a lease that already lapsed is not
    /// an error; the lock simply belongs to someone else by now.
    async fn release(&self, lease: &LockLease) -> AppResult<()>;
}

/// Run `f` while holding `key`.
///
/// `f` is never invoked if acquisition fails. The lease is released when
/// `f` returns, fails, panics (the panic is resumed after release) or
/// exceeds `options.hold_timeout`.
pub async fn with_lock<L, T, F, Fut>(
    lock: &L,
    key: &str,
    options: &LockOptions,
    f: F,
) -> AppResult<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce(LockLease) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let lease = lock.acquire(key, options).await?;
    debug!(strategy = lock.name(), key, holder = %lease.holder, token = ?lease.fencing_token, "Lock acquired");

    let work = AssertUnwindSafe(f(lease.clone())).catch_unwind();
    let outcome = match options.hold_timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(strategy = lock.name(), key, hold_ms = limit.as_millis() as u64, "Lock hold timeout elapsed, abandoning operation");
                Ok(Err(AppError::new(
                    ErrorKind::LockTimeout,
                    format!("Operation under lock '{key}' exceeded {}ms", limit.as_millis()),
                )))
            }
        },
        None => work.await,
    };

    if let Err(e) = lock.release(&lease).await {
        warn!(strategy = lock.name(), key, error = %e, "Failed to release lock; it will lapse at TTL");
    } else {
        debug!(strategy = lock.name(), key, held_ms = lease.acquired_at.elapsed().as_millis() as u64, "Lock released");
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records acquire/release calls without any real exclusion.
    #[derive(Debug, Default)]
    struct CountingLock {
        acquired: AtomicU32,
        released: AtomicU32,
        refuse: bool,
    }

    #[async_trait]
    impl DistributedLock for CountingLock {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn acquire(&self, key: &str, options: &LockOptions) -> AppResult<LockLease> {
            if self.refuse {
                return Err(AppError::lock_timeout(key, options.wait_timeout));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(LockLease::new(key, "me".to_string(), options.ttl))
        }

        async fn release(&self, _lease: &LockLease) -> AppResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let lock = CountingLock::default();
        let result: AppResult<()> = with_lock(&lock, "k", &LockOptions::default(), |_| async {
            Err(AppError::internal("boom"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_invoked_when_acquisition_fails() {
        let lock = CountingLock {
            refuse: true,
            ..CountingLock::default()
        };
        let invoked = &AtomicU32::new(0);
        let err = with_lock(&lock, "k", &LockOptions::default(), move |_| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockTimeout);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(lock.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_released_after_hold_timeout() {
        let lock = CountingLock::default();
        let options = LockOptions::default().with_hold_timeout(Duration::from_millis(20));
        let err = with_lock(&lock, "k", &options, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockTimeout);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_after_panic() {
        let lock = Arc::new(CountingLock::default());
        let task_lock = Arc::clone(&lock);
        let joined = tokio::spawn(async move {
            with_lock(task_lock.as_ref(), "k", &LockOptions::default(), |_| async {
                if true {
                    panic!("holder crashed");
                }
                Ok(())
            })
            .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }
}
