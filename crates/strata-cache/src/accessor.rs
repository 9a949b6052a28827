//! Cache-aside accessor.
//!
//! Serves a value for a key, invoking the caller-supplied producer only on
//! a miss and writing the result back with a TTL. When the store tier is
//! unreachable the accessor fails open: it calls the producer directly and
//! skips the write, so the underlying data stays available at the cost of
//! latency. Callers never see raw store-protocol errors.

use crate::error::{CacheError, CacheResult};
use crate::store::{KeyValueStore, Ttl};
use crate::supervisor::{InFlightTracker, StoreEvent};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strata_config::CacheConfig;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum Lookup<T> {
    Hit(T),
    Miss,
    /// The store could not answer; fall back to the producer and skip the
    /// write-back.
    Unavailable,
}

/// Cache-aside accessor over a shared store handle.
pub struct CacheAside<S> {
    store: Arc<S>,
    events: mpsc::Sender<StoreEvent>,
    tracker: Arc<InFlightTracker>,
    default_ttl: Ttl,
    op_timeout: Option<Duration>,
    single_flight: bool,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: KeyValueStore> CacheAside<S> {
    /// Creates an accessor with a 60 second default TTL, no operation
    /// timeout, and single-flight disabled.
    pub fn new(
        store: Arc<S>,
        events: mpsc::Sender<StoreEvent>,
        tracker: Arc<InFlightTracker>,
    ) -> Self {
        Self {
            store,
            events,
            tracker,
            default_ttl: Ttl::default(),
            op_timeout: None,
            single_flight: false,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Creates an accessor from cache configuration.
    pub fn from_config(
        store: Arc<S>,
        events: mpsc::Sender<StoreEvent>,
        tracker: Arc<InFlightTracker>,
        config: &CacheConfig,
    ) -> CacheResult<Self> {
        let default_ttl = Ttl::expires_in(config.default_ttl())?;
        Ok(Self {
            default_ttl,
            op_timeout: config.operation_timeout(),
            single_flight: config.single_flight,
            ..Self::new(store, events, tracker)
        })
    }

    /// Sets the TTL used by [`CacheAside::get`].
    pub fn with_default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Bounds each lookup and producer invocation.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Enables de-duplication of concurrent misses on the same key.
    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    /// [`CacheAside::get_with`] using the accessor's default TTL.
    pub async fn get<T, F, Fut>(&self, key: &str, producer: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.get_with(key, self.default_ttl, producer).await
    }

    /// Returns the cached value for `key`, or produces, stores and returns
    /// a fresh one.
    ///
    /// On a hit the producer is never invoked. On a miss the producer runs;
    /// its failure propagates verbatim and nothing is written. Store faults
    /// on the read path degrade to the producer (fail-open); store faults
    /// on the write path are logged and reported but never discard a
    /// successful producer result.
    pub async fn get_with<T, F, Fut>(&self, key: &str, ttl: Ttl, producer: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.get_with_deadline(key, ttl, self.op_timeout, producer)
            .await
    }

    /// [`CacheAside::get_with`] bounded by a caller-supplied deadline.
    ///
    /// The deadline applies to the store lookup and to the producer
    /// invocation. A lookup that overruns fails open; a producer that
    /// overruns surfaces [`CacheError::Timeout`].
    pub async fn get_with_deadline<T, F, Fut>(
        &self,
        key: &str,
        ttl: Ttl,
        deadline: Option<Duration>,
        producer: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }

        let _guard = self.tracker.guard();

        if self.single_flight {
            let gate = self.gate(key);
            let _flight = gate.lock().await;
            let result = self.fetch_or_produce(key, ttl, deadline, producer).await;
            drop(_flight);
            self.release_gate(key, &gate);
            result
        } else {
            self.fetch_or_produce(key, ttl, deadline, producer).await
        }
    }

    /// Deletes the entry for `key`. Idempotent; the sanctioned path for
    /// manual cache removal after the source of truth changed.
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }

        let _guard = self.tracker.guard();

        match self.store.delete(key).await {
            Ok(()) => {
                debug!(key = %key, "cache entry invalidated");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache invalidation failed");
                let translated = CacheError::StoreUnavailable(e.to_string());
                self.report(e);
                Err(translated)
            }
        }
    }

    async fn fetch_or_produce<T, F, Fut>(
        &self,
        key: &str,
        ttl: Ttl,
        deadline: Option<Duration>,
        producer: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lookup = self.lookup::<T>(key, deadline).await;
        let store_reachable = !matches!(lookup, Lookup::Unavailable);

        match lookup {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Miss | Lookup::Unavailable => {}
        }

        let produced = match deadline {
            Some(limit) => tokio::time::timeout(limit, producer())
                .await
                .map_err(|_| CacheError::Timeout(limit))?,
            None => producer().await,
        };
        // Producer failures surface verbatim; failures are never cached.
        let value = produced.map_err(CacheError::Producer)?;

        if store_reachable {
            self.write_back(key, ttl, &value).await;
        }

        Ok(value)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, deadline: Option<Duration>) -> Lookup<T> {
        let fetched = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.store.get(key)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(key = %key, "store lookup timed out, falling back to producer");
                    self.report(CacheError::Timeout(limit));
                    return Lookup::Unavailable;
                }
            },
            None => self.store.get(key).await,
        };

        match fetched {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(key = %key, "cache hit");
                    Lookup::Hit(value)
                }
                Err(e) => {
                    // A payload that does not decode reads as a store fault.
                    warn!(key = %key, error = %e, "failed to decode cached payload");
                    Lookup::Unavailable
                }
            },
            Ok(None) => {
                debug!(key = %key, "cache miss");
                Lookup::Miss
            }
            Err(e) => {
                warn!(key = %key, error = %e, "store lookup failed, falling back to producer");
                self.report(e);
                Lookup::Unavailable
            }
        }
    }

    /// Writes a produced value back to the store. Faults here never reach
    /// the caller: the produced value is already in hand.
    async fn write_back<T: Serialize>(&self, key: &str, ttl: Ttl, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode value for caching");
                return;
            }
        };

        if let Err(e) = self.store.set(key, &raw, ttl).await {
            warn!(key = %key, error = %e, "cache write failed");
            self.report(e);
        } else {
            debug!(key = %key, "cached fresh value");
        }
    }

    /// Reports a transport error to the supervisor without blocking the
    /// request path.
    fn report(&self, error: CacheError) {
        if error.is_transient() {
            let _ = self.events.try_send(StoreEvent::Error(error));
        }
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock();
        Arc::clone(
            gates
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn release_gate(&self, key: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock();
        if let Some(current) = gates.get(key) {
            // Drop the registry entry once no other flight holds it.
            if Arc::ptr_eq(current, gate) && Arc::strong_count(current) <= 2 {
                gates.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockKeyValueStore;

    fn accessor(store: MockKeyValueStore) -> CacheAside<MockKeyValueStore> {
        let (events, _rx) = mpsc::channel(16);
        CacheAside::new(Arc::new(store), events, InFlightTracker::new())
    }

    fn ttl() -> Ttl {
        Ttl::seconds(60).unwrap()
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let cache = accessor(MockKeyValueStore::new());
        let result = cache
            .get_with("", ttl(), || async { Ok("value".to_string()) })
            .await;
        assert!(matches!(result, Err(CacheError::InvalidKey)));
    }

    #[tokio::test]
    async fn test_hit_skips_producer_and_write() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|_| Ok(Some("\"cached\"".to_string())));
        // No set expectation: a write would panic the mock.

        let cache = accessor(store);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let value: String = cache
            .get_with("msg", ttl(), || async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("produced".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|_| Err(CacheError::StoreUnavailable("refused".into())));
        // No set expectation: the write is skipped when the store is down.

        let cache = accessor(store);
        let value: String = cache
            .get_with("msg", ttl(), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn test_lookup_failure_reports_event() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .returning(|_| Err(CacheError::StoreUnavailable("refused".into())));

        let (events, mut rx) = mpsc::channel(16);
        let cache = CacheAside::new(Arc::new(store), events, InFlightTracker::new());

        let _: String = cache
            .get_with("msg", ttl(), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();

        let event = rx.try_recv().expect("transport error should be reported");
        assert!(matches!(event, StoreEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_producer_failure_writes_nothing() {
        let mut store = MockKeyValueStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        // No set expectation: failures are never cached.

        let cache = accessor(store);
        let result: CacheResult<String> = cache
            .get_with("msg", ttl(), || async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(matches!(result, Err(CacheError::Producer(_))));
    }

    #[tokio::test]
    async fn test_corrupt_payload_falls_back_to_producer() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|_| Ok(Some("not json {{".to_string())));

        let cache = accessor(store);
        let value: u32 = cache.get_with("msg", ttl(), || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_write_failure_still_returns_value() {
        let mut store = MockKeyValueStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_set()
            .times(1)
            .returning(|_, _, _| Err(CacheError::StoreUnavailable("write refused".into())));

        let cache = accessor(store);
        let value: String = cache
            .get_with("msg", ttl(), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn test_miss_writes_back_once() {
        let mut store = MockKeyValueStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_set()
            .times(1)
            .withf(|key, raw, _| key == "msg" && raw == "\"fresh\"")
            .returning(|_, _, _| Ok(()));

        let cache = accessor(store);
        let value: String = cache
            .get_with("msg", ttl(), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn test_invalidate_translates_store_error() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(CacheError::StoreUnavailable("refused".into())));

        let cache = accessor(store);
        let result = cache.invalidate("msg").await;
        assert!(matches!(result, Err(CacheError::StoreUnavailable(_))));
    }

    /// Store whose lookups never complete; writes are counted.
    struct StalledStore {
        writes: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Ttl) -> CacheResult<()> {
            self.writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Ok(())
        }

        async fn ping(&self) -> CacheResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_deadline_fails_open() {
        let store = Arc::new(StalledStore {
            writes: std::sync::atomic::AtomicU32::new(0),
        });
        let (events, _rx) = mpsc::channel(16);
        let cache = CacheAside::new(Arc::clone(&store), events, InFlightTracker::new());

        let value: String = cache
            .get_with_deadline("msg", ttl(), Some(Duration::from_millis(50)), || async {
                Ok("fresh".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "fresh");
        // The write-back is skipped when the lookup could not complete.
        assert_eq!(store.writes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_producer_deadline_surfaces_timeout() {
        let mut store = MockKeyValueStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));

        let cache = accessor(store);
        let result: CacheResult<String> = cache
            .get_with_deadline("msg", ttl(), Some(Duration::from_millis(10)), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));
    }
}
