//! Optimistic-lock retry with task-scoped reentrancy.
//!
//! The retry state lives in a tokio task-local. A retried operation that
//! calls another retried operation runs the inner one as a single
//! attempt: its `OptimisticLock` error propagates to the outermost loop,
//! which re-runs everything. Only one retry loop ever exists per task.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use couponhub_core::config::RetryConfig;
use couponhub_core::error::ErrorKind;
use couponhub_core::result::AppResult;

tokio::task_local! {
    /// Attempt number of the retry loop that owns the current task.
    static RETRY_ATTEMPT: Cell<u32>;
}

/// Re-runs an operation on `OptimisticLock` errors with exponential
/// backoff plus jitter: `base * 2^attempt + random(0, base)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticRetry {
    max_retries: u32,
    base_delay: Duration,
}

impl OptimisticRetry {
    /// Allow `max_retries` retries after the first attempt.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Settings from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }

    /// Attempt number of the enclosing retry loop, if any.
    pub fn current_attempt() -> Option<u32> {
        RETRY_ATTEMPT.try_with(Cell::get).ok()
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << attempt.min(20));
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base)
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }

    /// Run `operation`, retrying the whole of it on `OptimisticLock`.
    ///
    /// Inside an enclosing retry loop the operation runs exactly once.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if let Some(attempt) = Self::current_attempt() {
            debug!(attempt, "Nested retried operation joins the enclosing retry loop");
            return operation().await;
        }

        RETRY_ATTEMPT
            .scope(Cell::new(0), async move {
                let mut attempt = 0;
                loop {
                    RETRY_ATTEMPT.with(|a| a.set(attempt));
                    match operation().await {
                        Err(e) if e.is(ErrorKind::OptimisticLock) && attempt < self.max_retries => {
                            let delay = self.backoff(attempt);
                            warn!(
                                attempt = attempt + 1,
                                max_retries = self.max_retries,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Optimistic lock conflict, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        Err(e) if e.is(ErrorKind::OptimisticLock) => {
                            warn!(attempts = attempt + 1, "Optimistic lock retries exhausted");
                            return Err(e);
                        }
                        other => return other,
                    }
                }
            })
            .await
    }
}

impl Default for OptimisticRetry {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
