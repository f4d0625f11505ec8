//! Redis connection management.

use redis::Client;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tracing::info;

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;

/// Redis client wrapper holding a reconnecting connection manager.
///
/// The raw [`Client`] is kept for the operations that need a dedicated
/// connection: pub/sub subscriptions and blocking stream reads.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    /// Redis connection manager (shared, reconnecting).
    conn: ConnectionManager,
    /// Key prefix for all keys.
    key_prefix: String,
    /// URL with the password masked, for logging.
    display_url: String,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("url", &self.display_url)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisClient {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, key_prefix: &str) -> AppResult<Self> {
        let display_url = mask_redis_url(url);
        info!(url = %display_url, "Connecting to Redis");

        let client = Client::open(url).map_err(|e| {
            AppError::with_source(ErrorKind::Cache, "Failed to create Redis client", e)
        })?;

        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            AppError::with_source(ErrorKind::Cache, "Failed to connect to Redis", e)
        })?;

        info!(url = %display_url, "Successfully connected to Redis");
        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.to_string(),
            display_url,
        })
    }

    /// Get a clone of the shared connection manager.
    pub fn conn_mut(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Open a dedicated connection, for commands that block the connection.
    pub async fn dedicated_connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Cache, "Failed to open Redis connection", e))
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Build a full key with the configured prefix.
    pub fn prefixed_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// The URL with its password masked.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }
}

/// Mask password in Redis URL for safe logging.
fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
