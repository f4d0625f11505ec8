//! Lock strategy, optimistic retry, and quota counter configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which mutual-exclusion strategy guards the coupon countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategyKind {
    /// Row-version check with whole-operation retry.
    Optimistic,
    /// Busy-polling `SET NX` lock.
    Spin,
    /// `SET NX` lock whose waiters block on a release notification.
    PubSub,
    /// FIFO ticket queue.
    Queue,
    /// Majority acquisition across independent stores.
    Quorum,
    /// Spin lock that also hands out a monotonic fencing token.
    Fencing,
}

impl LockStrategyKind {
    /// Every strategy, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Optimistic,
        Self::Spin,
        Self::PubSub,
        Self::Queue,
        Self::Quorum,
        Self::Fencing,
    ];

    /// Return the strategy as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Spin => "spin",
            Self::PubSub => "pubsub",
            Self::Queue => "queue",
            Self::Quorum => "quorum",
            Self::Fencing => "fencing",
        }
    }
}

impl fmt::Display for LockStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock acquisition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Strategy used by the issuance use case.
    #[serde(default = "default_strategy")]
    pub strategy: LockStrategyKind,
    /// Lock key TTL in milliseconds.
    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,
    /// Maximum time to wait for ownership, in milliseconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
    /// Base sleep between polling attempts, in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Per-node timeout for quorum acquisition, in milliseconds.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,
    /// Redis URLs of the independent quorum nodes.
    #[serde(default)]
    pub quorum_nodes: Vec<String>,
}

impl LockConfig {
    /// Lock key TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Maximum acquisition wait.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Base polling interval.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Per-node quorum timeout.
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            ttl_ms: default_ttl(),
            wait_timeout_ms: default_wait_timeout(),
            retry_interval_ms: default_retry_interval(),
            node_timeout_ms: default_node_timeout(),
            quorum_nodes: Vec::new(),
        }
    }
}

/// Optimistic-lock retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base in milliseconds (`base * 2^attempt + random(0, base)`).
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
        }
    }
}

/// Remaining-count counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Counter key TTL in days.
    #[serde(default = "default_quota_ttl_days")]
    pub ttl_days: u64,
}

impl QuotaConfig {
    /// Counter key TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_quota_ttl_days(),
        }
    }
}

fn default_strategy() -> LockStrategyKind {
    LockStrategyKind::Spin
}

fn default_ttl() -> u64 {
    5000
}

fn default_wait_timeout() -> u64 {
    3000
}

fn default_retry_interval() -> u64 {
    50
}

fn default_node_timeout() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    20
}

fn default_quota_ttl_days() -> u64 {
    30
}
