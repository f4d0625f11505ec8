//! Redis key/value store implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_core::traits::store::{KeyValueStore, Subscription};

use super::client::RedisClient;

/// Delete KEYS[1] only if it still holds ARGV[1].
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed key/value store.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    /// Create a store on top of a connected client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Cache, format!("Redis error: {e}"), e)
    }

    fn millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.client.conn_mut();
        redis::cmd("GET")
            .arg(self.client.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.client.conn_mut();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.client.prefixed_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::millis(ttl));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.client.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        redis::cmd("EXISTS")
            .arg(self.client.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();

        // SET key value PX ttl NX
        let result: Option<String> = redis::cmd("SET")
            .arg(self.client.prefixed_key(key))
            .arg(value)
            .arg("PX")
            .arg(Self::millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        Ok(result.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(self.client.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(removed == 1)
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.client.conn_mut();
        redis::cmd("INCR")
            .arg(self.client.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        redis::cmd("PEXPIRE")
            .arg(self.client.prefixed_key(key))
            .arg(Self::millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let mut conn = self.client.conn_mut();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(self.client.prefixed_key(channel))
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        debug!(channel, receivers, "Published message");
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> AppResult<Subscription> {
        let full_channel = self.client.prefixed_key(channel);
        let mut pubsub = self
            .client
            .client()
            .get_async_pubsub()
            .await
            .map_err(Self::map_err)?;
        pubsub
            .subscribe(&full_channel)
            .await
            .map_err(Self::map_err)?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "Dropping non-UTF-8 pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn list_push(&self, key: &str, value: &str) -> AppResult<u64> {
        let mut conn = self.client.conn_mut();
        redis::cmd("RPUSH")
            .arg(self.client.prefixed_key(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn list_head(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.client.conn_mut();
        redis::cmd("LINDEX")
            .arg(self.client.prefixed_key(key))
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn list_remove(&self, key: &str, value: &str) -> AppResult<u64> {
        let mut conn = self.client.conn_mut();
        redis::cmd("LREM")
            .arg(self.client.prefixed_key(key))
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pong == "PONG")
    }
}
