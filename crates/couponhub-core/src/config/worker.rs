//! Background worker configuration.

use serde::{Deserialize, Serialize};

/// Background worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker (publisher + consumer) is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Identifier of this worker instance (consumer name on the bus).
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Idle sleep between consumer polls, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            worker_id: default_worker_id(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_worker_id() -> String {
    "worker-1".to_string()
}

fn default_poll_interval() -> u64 {
    100
}
