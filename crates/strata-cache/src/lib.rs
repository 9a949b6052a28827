//! Strata Cache - Cache-Aside Layer with Supervised Store Connection
//!
//! A Redis-backed cache-aside layer with:
//! - Read-through/write-through access around any expensive producer
//! - Fail-open degradation when the cache tier is unreachable
//! - Typed TTLs with an explicit no-expiry mode
//! - Optional single-flight de-duplication of concurrent misses
//! - A connection supervisor with bounded, fixed-delay reconnection
//! - Graceful drain of in-flight operations on shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   Strata Cache Architecture                │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  Caller ──get_with(key, ttl, producer)──┐                  │
//! │                                         ▼                  │
//! │                                  ┌─────────────┐           │
//! │                                  │  CacheAside │           │
//! │                                  └──────┬──────┘           │
//! │                 hit ◄────────────────── │ ──────► miss:    │
//! │                                         │        producer  │
//! │                                  ┌──────┴───────┐          │
//! │                                  │KeyValueStore │          │
//! │                                  │ (Redis/mem)  │          │
//! │                                  └──────┬───────┘          │
//! │                                         │ StoreEvent       │
//! │                                  ┌──────┴───────────┐      │
//! │                                  │ConnectionSupervisor     │
//! │                                  │ retry / shutdown │      │
//! │                                  └──────────────────┘      │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_cache::{CacheAside, MemoryStore, Ttl};
//! use strata_cache::supervisor::InFlightTracker;
//! use std::sync::Arc;
//!
//! let (events, _rx) = tokio::sync::mpsc::channel(64);
//! let cache = CacheAside::new(Arc::new(MemoryStore::new()), events, InFlightTracker::new());
//!
//! let message: String = cache
//!     .get_with("msg", Ttl::seconds(60)?, || async {
//!         Ok("Hello from Redis!".to_string())
//!     })
//!     .await?;
//! ```

pub mod accessor;
pub mod error;
pub mod memory;
pub mod redis;
pub mod store;
pub mod supervisor;

pub use accessor::CacheAside;
pub use error::{CacheError, CacheResult};
pub use memory::MemoryStore;
pub use store::{KeyValueStore, Ttl};
pub use supervisor::{
    Connect, ConnectionState, ConnectionSupervisor, InFlightTracker, RetryBudget, ShutdownHandle,
    StoreEvent, SupervisorHandle,
};

pub use crate::redis::{create_pool, RedisConnector, RedisStore};
