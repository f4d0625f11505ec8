//! Application configuration schemas.
//!
//! All configuration structs are deserialized from TOML files via the
//! `config` crate. Each sub-module represents a logical configuration
//! section.

pub mod cache;
pub mod database;
pub mod lock;
pub mod logging;
pub mod outbox;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use self::cache::CacheConfig;
pub use self::database::DatabaseConfig;
pub use self::lock::{LockConfig, LockStrategyKind, QuotaConfig, RetryConfig};
pub use self::logging::LoggingConfig;
pub use self::outbox::{MessageBusConfig, OutboxConfig};
pub use self::worker::WorkerConfig;

use crate::error::AppError;

/// Root application configuration.
///
/// This struct is the top-level deserialization target for the merged
/// TOML configuration files (default.toml + environment overlay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// Key/value store settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Lock strategy settings.
    #[serde(default)]
    pub lock: LockConfig,
    /// Optimistic-lock retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Quota counter settings.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Outbox publisher settings.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Message bus settings.
    #[serde(default)]
    pub message_bus: MessageBusConfig,
    /// Background worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges the default configuration with an environment-specific overlay
    /// and environment variables prefixed with `COUPONHUB__`.
    pub fn load(env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("COUPONHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))
    }
}
