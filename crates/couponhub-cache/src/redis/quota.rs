//! Redis quota counter backed by server-side Lua scripts.
//!
//! Scripts are invoked by SHA through `EVALSHA`. A `NOSCRIPT` reply
//! triggers one `SCRIPT LOAD` followed by a single retry (see
//! [`crate::script::eval_with_reload`]).

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_core::traits::quota::{QuotaCounter, QuotaDecision};

use super::client::RedisClient;
use crate::keys;
use crate::script::eval_with_reload;

/// KEYS[1] = counter, ARGV[1] = total count, ARGV[2] = ttl seconds.
///
/// Returns `{success, issued, remaining}`.
const CHECK_AND_DECREMENT_SCRIPT: &str = r#"
local total = tonumber(ARGV[1])
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], total, 'EX', tonumber(ARGV[2]))
    current = total
else
    current = tonumber(current)
end
if current <= 0 then
    return {0, total - current, current}
end
local remaining = redis.call('DECR', KEYS[1])
return {1, total - remaining, remaining}
"#;

/// KEYS[1] = counter. Returns the new remaining count, or nil when the
/// counter does not exist.
const ROLLBACK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCR', KEYS[1])
end
return false
"#;

#[derive(Debug, Clone)]
struct LoadedScript {
    source: &'static str,
    sha: String,
}

impl LoadedScript {
    fn new(source: &'static str) -> Self {
        Self {
            source,
            sha: redis::Script::new(source).get_hash().to_string(),
        }
    }
}

/// Redis-backed per-coupon remaining-count counter.
#[derive(Debug, Clone)]
pub struct RedisQuotaCounter {
    client: RedisClient,
    ttl: Duration,
    decrement: LoadedScript,
    rollback: LoadedScript,
}

impl RedisQuotaCounter {
    /// Create a counter whose keys expire `ttl` after initialization.
    pub fn new(client: RedisClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            decrement: LoadedScript::new(CHECK_AND_DECREMENT_SCRIPT),
            rollback: LoadedScript::new(ROLLBACK_SCRIPT),
        }
    }

    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Cache, format!("Redis error: {e}"), e)
    }

    fn is_noscript(e: &redis::RedisError) -> bool {
        e.code() == Some("NOSCRIPT") || e.to_string().contains("NOSCRIPT")
    }

    async fn eval<T>(&self, script: &LoadedScript, key: &str, args: &[String]) -> AppResult<T>
    where
        T: redis::FromRedisValue + Send,
    {
        let conn = self.client.conn_mut();
        eval_with_reload(
            || {
                let mut conn = conn.clone();
                let mut cmd = redis::cmd("EVALSHA");
                cmd.arg(&script.sha).arg(1).arg(key);
                for arg in args {
                    cmd.arg(arg);
                }
                async move { cmd.query_async::<T>(&mut conn).await }
            },
            || {
                let mut conn = conn.clone();
                let mut cmd = redis::cmd("SCRIPT");
                cmd.arg("LOAD").arg(script.source);
                async move { cmd.query_async::<String>(&mut conn).await.map(|_| ()) }
            },
            Self::is_noscript,
        )
        .await
        .map_err(Self::map_err)
    }
}

#[async_trait]
impl QuotaCounter for RedisQuotaCounter {
    async fn check_and_decrement(
        &self,
        coupon_id: Uuid,
        total_count: i64,
    ) -> AppResult<QuotaDecision> {
        let key = self.client.prefixed_key(&keys::remaining_count(coupon_id));
        let args = [total_count.to_string(), self.ttl.as_secs().max(1).to_string()];
        let (success, issued, remaining): (i64, i64, i64) =
            self.eval(&self.decrement, &key, &args).await?;

        debug!(%coupon_id, success, issued, remaining, "Quota check-and-decrement");
        Ok(QuotaDecision {
            success: success == 1,
            issued,
            remaining,
        })
    }

    async fn rollback(&self, coupon_id: Uuid) -> AppResult<Option<i64>> {
        let key = self.client.prefixed_key(&keys::remaining_count(coupon_id));
        self.eval(&self.rollback, &key, &[]).await
    }

    async fn remaining(&self, coupon_id: Uuid) -> AppResult<Option<i64>> {
        let mut conn = self.client.conn_mut();
        redis::cmd("GET")
            .arg(self.client.prefixed_key(&keys::remaining_count(coupon_id)))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn reset(&self, coupon_id: Uuid, remaining: i64) -> AppResult<()> {
        let mut conn = self.client.conn_mut();
        redis::cmd("SET")
            .arg(self.client.prefixed_key(&keys::remaining_count(coupon_id)))
            .arg(remaining)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::map_err)
    }
}
