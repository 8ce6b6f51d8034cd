//! # Query Binding Tests
//!
//! Integration tests for the query binding against a shared cache:
//! - single-flight fetching and staleness handling
//! - lifecycle (attach/detach/enable) behavior
//! - error surfacing with stale data kept visible
//! - documented multi-binding semantics (no cross-binding dedup)
//!
//! Fetches that must stay observable mid-flight park on a `Notify` gate;
//! invocation counts come from shared atomics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::sleep;

use requery::{Query, QueryBuilder, QueryCache, QueryError, Status};

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Builder for a query whose fetch parks on `gate` until released,
/// counting invocations and resolving to `"hello"`
fn gated_query(
    cache: &QueryCache,
    key: &str,
    gate: &Arc<Notify>,
    calls: &Arc<AtomicUsize>,
) -> QueryBuilder {
    let gate = Arc::clone(gate);
    let calls = Arc::clone(calls);
    Query::builder(cache.clone(), key, move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            Ok(json!("hello"))
        }
    })
}

/// Builder for a query resolving immediately to its invocation number
fn counted_query(cache: &QueryCache, key: &str, calls: &Arc<AtomicUsize>) -> QueryBuilder {
    let calls = Arc::clone(calls);
    Query::builder(cache.clone(), key, move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(json!(n)) }
    })
}

// ============================================================================
// Fetch lifecycle and single-flight
// ============================================================================

#[tokio::test]
async fn empty_cache_fetches_once_and_settles() {
    let cache = QueryCache::new();
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let query = gated_query(&cache, "greeting", &gate, &calls)
        .stale_time(Duration::from_millis(1000))
        .build();

    assert_eq!(query.status(), Status::Idle);
    assert!(query.data().is_none());

    let attached = query.clone();
    let handle = tokio::spawn(async move { attached.attach().await });
    sleep(Duration::from_millis(30)).await;

    assert!(query.is_loading());
    assert!(query.is_fetching());
    assert_eq!(query.status(), Status::Loading);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Staleness re-evaluations while fetching are no-ops (single-flight)
    query.revalidate().await;
    query.revalidate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    handle.await.unwrap();

    assert_eq!(query.status(), Status::Success);
    assert_eq!(*query.data().unwrap(), json!("hello"));
    assert!(query.error().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fresh_cache_entry_skips_the_fetch() {
    let cache = QueryCache::new();
    cache.set("k", json!("cached"));
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_secs(60))
        .build();

    query.attach().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(*query.data().unwrap(), json!("cached"));
    assert_eq!(query.status(), Status::Success);
}

#[tokio::test]
async fn attach_is_idempotent() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_secs(60))
        .build();

    query.attach().await;
    query.attach().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refetch_bypasses_freshness() {
    let cache = QueryCache::new();
    cache.set("k", json!("cached"));
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_secs(60))
        .build();
    query.attach().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    query.refetch().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*query.data().unwrap(), json!(1));
}

// ============================================================================
// Staleness
// ============================================================================

#[tokio::test]
async fn staleness_is_monotonic_around_the_window_boundary() {
    let cache = QueryCache::new();
    cache.set("k", json!("v"));
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_millis(300))
        .build();
    query.attach().await;

    // Sampled close under the boundary (age ≈ 240ms of a 300ms window,
    // leaving headroom for scheduling jitter): still fresh
    sleep(Duration::from_millis(240)).await;
    query.revalidate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Sampled just past it (age ≈ 360ms): stale, exactly one fetch
    sleep(Duration::from_millis(120)).await;
    query.revalidate().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_stale_time_refetches_on_attach_but_not_after_settle() {
    let cache = QueryCache::new();
    cache.set("k", json!("old"));
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls).build();

    query.attach().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A settled fetch stays settled under stale_time = 0
    query.revalidate().await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Errors and stale-while-error
// ============================================================================

#[tokio::test]
async fn failed_fetch_keeps_stale_data_and_surfaces_the_error() {
    let cache = QueryCache::new();
    cache.set("k", json!("stale"));
    let calls = Arc::new(AtomicUsize::new(0));
    let inner_calls = Arc::clone(&calls);
    let query = Query::builder(cache.clone(), "k", move || {
        inner_calls.fetch_add(1, Ordering::SeqCst);
        async { Err(QueryError::fetch("boom")) }
    })
    .build();

    query.attach().await;

    assert_eq!(query.status(), Status::Error);
    assert!(query.is_error());
    assert_eq!(query.error().unwrap().message(), "boom");
    assert_eq!(*query.data().unwrap(), json!("stale"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The recorded error blocks automatic refetch...
    query.revalidate().await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // ...but an explicit retry goes through
    query.refetch().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn on_error_hook_fires_and_panic_in_it_is_contained() {
    let cache = QueryCache::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let query = Query::builder(cache.clone(), "k", || async {
        Err(QueryError::fetch("down"))
    })
    .on_error(move |err| {
        seen_in.lock().push(err.message());
        panic!("hook bug");
    })
    .build();

    query.attach().await;

    assert_eq!(seen.lock().as_slice(), ["down"]);
    assert_eq!(query.status(), Status::Error);
}

// ============================================================================
// Lifecycle (enable/disable, detach)
// ============================================================================

#[tokio::test]
async fn disabled_binding_never_subscribes_or_fetches() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls).enabled(false).build();

    query.attach().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!cache.contains("k"));
    assert_eq!(query.status(), Status::Idle);

    query.set_enabled(true).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.status(), Status::Success);

    query.set_enabled(false).await;
    // Data stays visible; the subscription is gone but the cached entry
    // survives because it holds data.
    assert_eq!(*query.data().unwrap(), json!(1));
    assert!(cache.contains("k"));
}

#[tokio::test]
async fn reenabling_after_a_midflight_disable_refetches() {
    let cache = QueryCache::new();
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let query = gated_query(&cache, "k", &gate, &calls).build();

    let attached = query.clone();
    let handle = tokio::spawn(async move { attached.attach().await });
    sleep(Duration::from_millis(20)).await;
    assert!(query.is_fetching());

    // Disable while the fetch is in flight, then let it settle
    query.set_enabled(false).await;
    gate.notify_one();
    handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*query.data().unwrap(), json!("hello"));

    // Under the default zero stale time, re-enabling must fetch again
    gate.notify_one(); // pre-arm the gate so the second fetch resolves
    query.set_enabled(true).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.status(), Status::Success);
}

#[tokio::test]
async fn detached_in_flight_fetch_still_writes_the_shared_cache() {
    let cache = QueryCache::new();
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let query = gated_query(&cache, "k", &gate, &calls).build();

    let attached = query.clone();
    let handle = tokio::spawn(async move { attached.attach().await });
    sleep(Duration::from_millis(20)).await;
    query.detach();

    gate.notify_one();
    handle.await.unwrap();

    assert_eq!(*cache.get("k").unwrap().data.unwrap(), json!("hello"));
    assert_eq!(query.status(), Status::Success);
}

// ============================================================================
// Invalidation and notification-driven refetch
// ============================================================================

#[tokio::test]
async fn invalidate_clears_data_then_refetches() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_secs(60))
        .build();
    query.attach().await;
    assert_eq!(*query.data().unwrap(), json!(1));

    query.invalidate();

    // Synchronous notification clears the local view immediately
    assert!(query.data().is_none());

    // The scheduled revalidation repopulates it
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*query.data().unwrap(), json!(2));
    assert_eq!(query.status(), Status::Success);
}

#[tokio::test]
async fn sibling_write_updates_a_settled_binding() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = counted_query(&cache, "k", &calls)
        .stale_time(Duration::from_secs(60))
        .build();
    query.attach().await;

    cache.set("k", json!("external"));

    assert_eq!(*query.data().unwrap(), json!("external"));
    sleep(Duration::from_millis(30)).await;
    // Fresh external write, no extra fetch
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Multi-binding semantics (documented limitation: no cross-binding dedup)
// ============================================================================

#[tokio::test]
async fn two_bindings_on_one_key_both_fetch_last_write_wins() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = counted_query(&cache, "k", &calls).build();
    let second = counted_query(&cache, "k", &calls).build();

    first.attach().await;
    second.attach().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // The second write is the one everyone converges on
    assert_eq!(*first.data().unwrap(), json!(2));
    assert_eq!(*second.data().unwrap(), json!(2));

    sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Success hook
// ============================================================================

#[tokio::test]
async fn on_success_hook_receives_the_fetched_value() {
    let cache = QueryCache::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let query = Query::builder(cache.clone(), "k", || async { Ok(json!("payload")) })
        .on_success(move |value| seen_in.lock().push(value.clone()))
        .build();

    query.attach().await;

    assert_eq!(seen.lock().as_slice(), [json!("payload")]);
}
