//! The six lock strategies.

pub mod fencing;
pub mod optimistic;
pub mod pubsub;
pub mod queue;
pub mod quorum;
pub mod spin;

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

pub use fencing::FencingLock;
pub use optimistic::OptimisticLock;
pub use pubsub::PubSubLock;
pub use queue::QueueLock;
pub use quorum::QuorumLock;
pub use spin::SpinLock;

/// Random identity for one acquisition attempt.
pub(crate) fn new_holder_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sleep for `interval` plus up to half of it in jitter, never past `deadline`.
pub(crate) async fn poll_pause(interval: Duration, deadline: Instant) {
    let half = interval.as_millis() as u64 / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half)
    };
    let wake = (Instant::now() + interval + Duration::from_millis(jitter)).min(deadline);
    tokio::time::sleep_until(wake).await;
}
