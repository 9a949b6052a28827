//! Cache error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached or answered with a protocol
    /// error. Read paths degrade to the producer instead of surfacing this.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The caller-supplied producer failed. Propagated verbatim; never
    /// cached.
    #[error(transparent)]
    Producer(#[from] anyhow::Error),

    /// A cached payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The connection supervisor exhausted its retry budget. Terminal; the
    /// composition root decides the exit policy.
    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    /// Cache keys must be non-empty.
    #[error("Cache key must not be empty")]
    InvalidKey,

    /// Zero-duration TTLs are rejected; permanent entries use the explicit
    /// no-expiry mode.
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Returns true if this error is transient and recoverable through
    /// fail-open degradation or reconnection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable(_) | CacheError::Timeout(_)
        )
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::StoreUnavailable(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::StoreUnavailable(err.to_string())
    }
}
