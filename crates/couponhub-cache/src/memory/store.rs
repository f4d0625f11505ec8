//! In-memory key/value store using dashmap and tokio broadcast channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::debug;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::store::{KeyValueStore, Subscription};

/// Buffer size of each pub/sub channel.
const CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn string(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Str(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Str(s) => Some(s),
            Value::List(_) => None,
        }
    }
}

/// In-memory key/value store for single-node deployments and tests.
///
/// Every mutating operation runs under the dashmap shard lock of its key,
/// which gives the same per-key atomicity a Redis command or script does.
/// Expired entries are evicted lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// Keyspace.
    entries: Arc<DashMap<String, StoredEntry>>,
    /// Channel name → broadcast sender.
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (test and diagnostics helper).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, e| e.is_expired());
    }

    fn wrong_type(key: &str) -> AppError {
        AppError::cache(format!("WRONGTYPE operation against key '{key}'"))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(e) if e.is_expired() => true,
            Some(e) => {
                return e
                    .as_str()
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| Self::wrong_type(key));
            }
        };
        if expired {
            self.evict_if_expired(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.entries
            .insert(key.to_string(), StoredEntry::string(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired()))
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let live = self.entries.get(key).map(|e| !e.is_expired());
        match live {
            Some(true) => Ok(true),
            Some(false) => {
                self.evict_if_expired(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::string(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::string(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, e| !e.is_expired() && e.as_str() == Some(expected))
            .is_some())
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::string("1", None));
                    return Ok(1);
                }
                let entry = occupied.get_mut();
                let current: i64 = entry
                    .as_str()
                    .ok_or_else(|| Self::wrong_type(key))?
                    .parse()
                    .map_err(|_| AppError::cache(format!("Value at '{key}' is not an integer")))?;
                let next = current + 1;
                entry.value = Value::Str(next.to_string());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::string("1", None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let updated = match self.entries.get_mut(key) {
            Some(mut e) if !e.is_expired() => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        };
        Ok(updated)
    }

    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let sent = self
            .channels
            .get(channel)
            .map(|tx| tx.send(message.to_string()));
        let receivers = match sent {
            Some(Ok(receivers)) => receivers,
            Some(Err(_)) => {
                // Every subscriber is gone.
                self.channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                0
            }
            None => 0,
        };
        debug!(channel, receivers, "Published message");
        Ok(receivers as u64)
    }

    async fn subscribe(&self, channel: &str) -> AppResult<Subscription> {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn list_push(&self, key: &str, value: &str) -> AppResult<u64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry {
                        value: Value::List(VecDeque::from([value.to_string()])),
                        expires_at: None,
                    });
                    return Ok(1);
                }
                match &mut occupied.get_mut().value {
                    Value::List(list) => {
                        list.push_back(value.to_string());
                        Ok(list.len() as u64)
                    }
                    Value::Str(_) => Err(Self::wrong_type(key)),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    value: Value::List(VecDeque::from([value.to_string()])),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn list_head(&self, key: &str) -> AppResult<Option<String>> {
        match self.entries.get(key) {
            Some(e) if !e.is_expired() => match &e.value {
                Value::List(list) => Ok(list.front().cloned()),
                Value::Str(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> AppResult<u64> {
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut e) => match &mut e.value {
                Value::List(list) => {
                    let before = list.len();
                    list.retain(|v| v != value);
                    ((before - list.len()) as u64, list.is_empty())
                }
                Value::Str(_) => return Err(Self::wrong_type(key)),
            },
            None => (0, false),
        };
        if now_empty {
            self.entries
                .remove_if(key, |_, e| matches!(&e.value, Value::List(l) if l.is_empty()));
        }
        Ok(removed)
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_respects_existing_owner() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock:a", "holder-1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock:a", "holder-2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("holder-1"));
    }

    #[tokio::test]
    async fn test_set_nx_takes_over_expired_key() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock:b", "holder-1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.set_nx("lock:b", "holder-2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals_only_removes_own_value() {
        let store = MemoryStore::new();
        store.set_nx("lock:c", "holder-1", Duration::from_secs(5)).await.unwrap();
        assert!(!store.delete_if_equals("lock:c", "holder-2").await.unwrap());
        assert!(store.exists("lock:c").await.unwrap());
        assert!(store.delete_if_equals("lock:c", "holder-1").await.unwrap());
        assert!(!store.exists("lock:c").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_starts_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("fence").await.unwrap(), 1);
        assert_eq!(store.incr("fence").await.unwrap(), 2);
        store.set("text", "abc", None).await.unwrap();
        assert!(store.incr("text").await.is_err());
    }

    #[tokio::test]
    async fn test_list_fifo_operations() {
        let store = MemoryStore::new();
        store.list_push("q", "t1").await.unwrap();
        store.list_push("q", "t2").await.unwrap();
        assert_eq!(store.list_head("q").await.unwrap().as_deref(), Some("t1"));
        assert_eq!(store.list_remove("q", "t1").await.unwrap(), 1);
        assert_eq!(store.list_head("q").await.unwrap().as_deref(), Some("t2"));
        store.list_remove("q", "t2").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chan").await.unwrap();
        assert_eq!(store.publish("chan", "released").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("released"));
    }

    #[tokio::test]
    async fn test_abandoned_channels_are_pruned() {
        let store = MemoryStore::new();
        drop(store.subscribe("released:a").await.unwrap());
        assert_eq!(store.publish("released:a", "x").await.unwrap(), 0);
        assert!(store.channels.is_empty());

        let _b = store.subscribe("released:b").await.unwrap();
        drop(store.subscribe("released:c").await.unwrap());
        let _d = store.subscribe("released:d").await.unwrap();
        assert_eq!(store.channels.len(), 2);
        assert!(!store.channels.contains_key("released:c"));
    }
}
