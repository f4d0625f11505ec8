//! Key/value store trait backing the lock strategies.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::result::AppResult;

/// Stream of payloads published on a pub/sub channel.
pub type Subscription = BoxStream<'static, String>;

/// Trait for key/value backends (Redis or in-memory).
///
/// Every method that the lock strategies rely on for correctness
/// (`set_nx`, `delete_if_equals`, `incr`, the list operations) must be
/// atomic with respect to other callers of the same backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug + 'static {
    /// Get a value by key. Returns `None` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Set a value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> AppResult<bool>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// Set a value only if the key does not already exist (NX).
    /// Returns `true` if the value was set, `false` if the key already existed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Delete the key only if it still holds `expected`.
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Increment an integer value by 1. Returns the new value.
    async fn incr(&self, key: &str) -> AppResult<i64>;

    /// Set the TTL on an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    /// Publish a message on a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64>;

    /// Subscribe to a channel. Messages published after this call returns
    /// are delivered on the stream.
    async fn subscribe(&self, channel: &str) -> AppResult<Subscription>;

    /// Append a value to the tail of a list. Returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> AppResult<u64>;

    /// Return the head of a list without removing it.
    async fn list_head(&self, key: &str) -> AppResult<Option<String>>;

    /// Remove every occurrence of `value` from a list. Returns the count removed.
    async fn list_remove(&self, key: &str, value: &str) -> AppResult<u64>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> AppResult<bool>;
}
