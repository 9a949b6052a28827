//! Key-value store abstraction.
//!
//! The accessor and supervisor only ever see this trait; Redis and the
//! in-memory store plug in behind it. Expiry is the store's job: a `get`
//! never returns an entry past its TTL window.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::time::Duration;

/// Time-to-live for a cache entry.
///
/// A zero-duration TTL is rejected at construction; entries that should
/// never expire use [`Ttl::no_expiry`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl(Option<Duration>);

impl Ttl {
    /// Creates a TTL that expires after `duration`.
    pub fn expires_in(duration: Duration) -> CacheResult<Self> {
        if duration.is_zero() {
            return Err(CacheError::InvalidTtl(
                "TTL must be greater than zero".to_string(),
            ));
        }
        Ok(Self(Some(duration)))
    }

    /// Creates a TTL that expires after `secs` seconds.
    pub fn seconds(secs: u64) -> CacheResult<Self> {
        Self::expires_in(Duration::from_secs(secs))
    }

    /// Creates a TTL that never expires.
    pub const fn no_expiry() -> Self {
        Self(None)
    }

    /// The expiry duration, or `None` for permanent entries.
    pub fn duration(&self) -> Option<Duration> {
        self.0
    }
}

impl Default for Ttl {
    /// 60 seconds, the accessor's default expiry.
    fn default() -> Self {
        Self(Some(Duration::from_secs(60)))
    }
}

/// Backing key-value store for the cache-aside accessor.
///
/// All operations are atomic per key; the store enforces TTLs itself and
/// reports expired entries as absent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Looks up a key. Returns `None` when absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Writes a value with the given TTL, replacing any previous entry.
    async fn set(&self, key: &str, value: &str, ttl: Ttl) -> CacheResult<()>;

    /// Deletes a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Verifies the store is reachable.
    async fn ping(&self) -> CacheResult<()>;
}
