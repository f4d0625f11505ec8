//! Unified application error types for CouponHub.
//!
//! All crates map their internal errors into [`AppError`] for consistent
//! propagation through the ? operator.

use std::fmt;
use thiserror::Error;

/// Top-level error kind categorization used across the entire application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The requested resource was not found.
    NotFound,
    /// Input validation failed (unknown coupon code, mismatched idempotency key, ...).
    Validation,
    /// A conflict occurred (duplicate issuance, already cancelled, ...).
    Conflict,
    /// Exclusive ownership of a lock key could not be obtained in time.
    LockTimeout,
    /// A row-version check failed because another writer got there first.
    OptimisticLock,
    /// A write presented a fencing token older than the last accepted one.
    FencingTokenViolation,
    /// No units of the coupon remain.
    CouponExhausted,
    /// The coupon is outside its validity window.
    CouponExpired,
    /// An internal error occurred.
    Internal,
    /// A database error occurred.
    Database,
    /// A key/value store error occurred.
    Cache,
    /// A message bus error occurred.
    MessageBus,
    /// A configuration error occurred.
    Configuration,
    /// A serialization/deserialization error occurred.
    Serialization,
    /// The service is temporarily unavailable.
    ServiceUnavailable,
}

impl ErrorKind {
    /// HTTP-equivalent status code for this kind of failure.
    ///
    /// Client-correctable outcomes map to 4xx, lock contention and
    /// infrastructure failures map to retryable 5xx.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Validation => 400,
            Self::Conflict | Self::FencingTokenViolation => 409,
            Self::CouponExhausted | Self::CouponExpired => 422,
            Self::LockTimeout | Self::ServiceUnavailable => 503,
            Self::OptimisticLock
            | Self::Internal
            | Self::Database
            | Self::Cache
            | Self::MessageBus
            | Self::Configuration
            | Self::Serialization => 500,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout
                | Self::ServiceUnavailable
                | Self::Cache
                | Self::Database
                | Self::MessageBus
        )
    }

    /// Whether the request was refused on its merits, so repeating it
    /// unchanged can never succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::Validation
                | Self::Conflict
                | Self::CouponExhausted
                | Self::CouponExpired
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::LockTimeout => write!(f, "LOCK_ACQUISITION_TIMEOUT"),
            Self::OptimisticLock => write!(f, "OPTIMISTIC_LOCK"),
            Self::FencingTokenViolation => write!(f, "FENCING_TOKEN_VIOLATION"),
            Self::CouponExhausted => write!(f, "COUPON_EXHAUSTED"),
            Self::CouponExpired => write!(f, "COUPON_EXPIRED"),
            Self::Internal => write!(f, "INTERNAL"),
            Self::Database => write!(f, "DATABASE"),
            Self::Cache => write!(f, "CACHE"),
            Self::MessageBus => write!(f, "MESSAGE_BUS"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Serialization => write!(f, "SERIALIZATION"),
            Self::ServiceUnavailable => write!(f, "SERVICE_UNAVAILABLE"),
        }
    }
}

/// The unified application error used throughout CouponHub.
///
/// All crate-specific errors are mapped into `AppError` using `From` impls
/// or explicit `.map_err()` calls. This provides a single error type for
/// the entire application boundary.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    /// The category of error.
    pub kind: ErrorKind,
    /// A human-readable error message.
    pub message: String,
    /// Optional underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new application error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new application error with an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Create a lock acquisition timeout error.
    pub fn lock_timeout(key: &str, waited: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::LockTimeout,
            format!("Could not acquire lock '{key}' within {}ms", waited.as_millis()),
        )
    }

    /// Create an optimistic lock (version conflict) error.
    pub fn optimistic_lock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OptimisticLock, message)
    }

    /// Create a fencing token violation error.
    pub fn fencing_violation(presented: i64, accepted: i64) -> Self {
        Self::new(
            ErrorKind::FencingTokenViolation,
            format!("Fencing token {presented} is older than accepted token {accepted}"),
        )
    }

    /// Create a coupon-exhausted error.
    pub fn coupon_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CouponExhausted, message)
    }

    /// Create a coupon-expired error.
    pub fn coupon_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CouponExpired, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Create a key/value store error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    /// Create a message bus error.
    pub fn message_bus(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MessageBus, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Create a service-unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    /// Returns `true` if this error has the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(
            ErrorKind::Serialization,
            format!("JSON serialization error: {err}"),
            err,
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_source(
            ErrorKind::Configuration,
            format!("Configuration error: {err}"),
            err,
        )
    }
}
