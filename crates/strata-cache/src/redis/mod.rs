//! Redis-backed key-value store.

use crate::error::{CacheError, CacheResult};
use crate::store::{KeyValueStore, Ttl};
use crate::supervisor::Connect;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use strata_config::StoreConfig;
use tracing::{debug, info};

/// Create a Redis connection pool.
///
/// Building a pool does not connect; establishing the connection is the
/// supervisor's job, through [`RedisConnector`].
pub fn create_pool(config: &StoreConfig) -> CacheResult<Pool> {
    info!(host = %config.host, port = config.port, "Creating Redis connection pool...");

    let cfg = Config::from_url(config.url());

    let pool = cfg
        .builder()
        .map_err(|e| CacheError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| CacheError::Configuration(format!("Failed to create pool: {}", e)))?;

    Ok(pool)
}

/// Redis-backed store with a configurable key prefix.
pub struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    /// Create a new store over an existing pool.
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn namespaced(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(self.namespaced(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Ttl) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let key = self.namespaced(key);
        match ttl.duration() {
            Some(duration) => {
                // SET with EX; sub-second TTLs round up to one second.
                let secs = duration.as_secs().max(1);
                let _: () = conn.set_ex(&key, value, secs).await?;
            }
            None => {
                let _: () = conn.set(&key, value).await?;
            }
        }
        debug!(key = %key, "stored cache entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        // DEL returns the number of removed keys; zero is fine.
        let _: u64 = conn.del(self.namespaced(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}

/// Connector used by the supervisor to establish and release the Redis
/// connection underlying a [`RedisStore`].
pub struct RedisConnector {
    pool: Pool,
}

impl RedisConnector {
    /// Create a connector over the same pool as the store it supervises.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Connect for RedisConnector {
    async fn establish(&self) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }

    async fn release(&self) {
        self.pool.close();
    }
}
