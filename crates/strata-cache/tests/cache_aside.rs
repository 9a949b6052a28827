//! End-to-end accessor behavior against the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_cache::supervisor::InFlightTracker;
use strata_cache::{CacheAside, CacheError, MemoryStore, Ttl};
use tokio::sync::mpsc;

fn cache() -> CacheAside<MemoryStore> {
    let (events, _rx) = mpsc::channel(16);
    CacheAside::new(Arc::new(MemoryStore::new()), events, InFlightTracker::new())
}

fn ttl_60s() -> Ttl {
    Ttl::seconds(60).unwrap()
}

#[tokio::test]
async fn cold_key_invokes_producer_exactly_once() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let value: String = cache
        .get_with("greeting", ttl_60s(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("hello".to_string())
        })
        .await
        .unwrap();

    assert_eq!(value, "hello");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn warm_key_returns_cached_value_without_producer() {
    let cache = cache();

    let first: String = cache
        .get_with("msg", ttl_60s(), || async {
            Ok("Hello from Redis!".to_string())
        })
        .await
        .unwrap();
    assert_eq!(first, "Hello from Redis!");

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let second: String = cache
        .get_with("msg", ttl_60s(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("OTHER".to_string())
        })
        .await
        .unwrap();

    assert_eq!(second, "Hello from Redis!");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalidate_forces_reproduction_within_ttl() {
    let cache = cache();

    let _: u32 = cache.get_with("n", ttl_60s(), || async { Ok(1) }).await.unwrap();
    cache.invalidate("n").await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let value: u32 = cache
        .get_with("n", ttl_60s(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        })
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidate_absent_key_is_idempotent() {
    let cache = cache();
    cache.invalidate("never-written").await.unwrap();
    cache.invalidate("never-written").await.unwrap();
}

#[tokio::test]
async fn producer_failure_is_not_cached() {
    let cache = cache();

    let result: Result<u32, CacheError> = cache
        .get_with("flaky", ttl_60s(), || async {
            Err(anyhow::anyhow!("upstream down"))
        })
        .await;
    assert!(matches!(result, Err(CacheError::Producer(_))));

    // The failure was not written; the next call produces again.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let value: u32 = cache
        .get_with("flaky", ttl_60s(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_reproduced() {
    let cache = cache();

    let _: u32 = cache.get_with("t", ttl_60s(), || async { Ok(1) }).await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let value: u32 = cache
        .get_with("t", ttl_60s(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        })
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn no_expiry_entry_survives() {
    let cache = cache();

    let _: u32 = cache
        .get_with("pinned", Ttl::no_expiry(), || async { Ok(7) })
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;

    let value: u32 = cache
        .get_with("pinned", Ttl::no_expiry(), || async {
            Err(anyhow::anyhow!("should not be produced again"))
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn structured_values_round_trip() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Payload {
        time: String,
        message: String,
    }

    let cache = cache();
    let fresh = Payload {
        time: "2026-08-30T00:00:00Z".to_string(),
        message: "Fresh data".to_string(),
    };

    let produced = fresh.clone();
    let first: Payload = cache
        .get_with("someData", ttl_60s(), || async move { Ok(produced) })
        .await
        .unwrap();
    assert_eq!(first, fresh);

    let second: Payload = cache
        .get_with("someData", ttl_60s(), || async {
            Err(anyhow::anyhow!("must come from cache"))
        })
        .await
        .unwrap();
    assert_eq!(second, fresh);
}

#[tokio::test]
async fn single_flight_runs_producer_once_for_concurrent_misses() {
    let (events, _rx) = mpsc::channel(16);
    let cache = Arc::new(
        CacheAside::new(Arc::new(MemoryStore::new()), events, InFlightTracker::new())
            .with_single_flight(true),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();

    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            let counter = Arc::clone(&calls);
            let value: String = cache
                .get_with("shared", Ttl::seconds(60).unwrap(), || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("expensive".to_string())
                })
                .await
                .unwrap();
            value
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), "expensive");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_misses_without_single_flight_each_produce() {
    let (events, _rx) = mpsc::channel(16);
    let cache = Arc::new(CacheAside::new(
        Arc::new(MemoryStore::new()),
        events,
        InFlightTracker::new(),
    ));

    let calls = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let mut tasks = Vec::new();

    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            let counter = Arc::clone(&calls);
            let gate = Arc::clone(&barrier);
            let _: String = cache
                .get_with("shared", Ttl::seconds(60).unwrap(), || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Hold every producer open until all four are in flight.
                    gate.wait().await;
                    Ok("dup".to_string())
                })
                .await
                .unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    // The observed design: no de-duplication by default.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}
