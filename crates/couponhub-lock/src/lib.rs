//! # couponhub-lock
//!
//! Mutual exclusion for the per-coupon countdown.
//!
//! Every strategy implements [`DistributedLock`]; [`with_lock`] wraps an
//! operation so that the lock is released on every exit path. The
//! strategy used by the issuance path is picked from configuration via
//! [`LockManager`]:
//!
//! - **optimistic**: no lock; row-version conflicts are retried ([`OptimisticRetry`])
//! - **spin**: `SET NX` with polling
//! - **pubsub**: `SET NX`, waiters block on a release channel
//! - **queue**: FIFO tickets, first requested is first served
//! - **quorum**: majority of independent stores
//! - **fencing**: spin lock that also hands out a monotonic token

pub mod contract;
pub mod manager;
pub mod retry;
pub mod strategy;

pub use contract::{DistributedLock, LockLease, LockOptions, with_lock};
pub use manager::LockManager;
pub use retry::OptimisticRetry;
