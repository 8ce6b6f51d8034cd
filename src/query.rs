//! Query binding - keeps one consumer's view of a cache key correct.
//!
//! A `Query` owns exactly one cache key for its attached lifetime. It
//! fetches when the cached value is stale, missing, or freshly enabled,
//! never while another fetch of the same binding is in flight, and exposes
//! a derived [`Status`] alongside the data and error.
//!
//! Lifecycle is framework-agnostic: the host calls [`Query::attach`] on
//! mount, [`Query::detach`] on unmount, and may call [`Query::revalidate`]
//! on any dependency change. Cache notifications schedule their own
//! revalidation on the ambient tokio runtime.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::QueryError;
use crate::hooks::run_hook;
use crate::status::Status;
use crate::store::{CacheEntry, QueryCache, Subscription};

type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;
type SuccessHook = Arc<dyn Fn(&Value) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Fetch lifecycle of a single binding.
///
/// `Idle` is fetch-eligible; `Settled` means the last fetch succeeded and
/// the binding waits for new staleness; a failed fetch returns to `Idle`
/// (manual-retry eligible) with the error surfaced separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStatus {
    Idle,
    Fetching,
    Settled,
}

struct QueryState {
    data: Option<Arc<Value>>,
    error: Option<Arc<QueryError>>,
    fetch_status: FetchStatus,
    enabled: bool,
    subscription: Option<Subscription>,
}

impl QueryState {
    /// Public status as a pure function of the underlying fields
    fn status(&self) -> Status {
        if self.fetch_status == FetchStatus::Fetching {
            Status::Loading
        } else if self.error.is_some() {
            Status::Error
        } else if self.data.is_some() {
            Status::Success
        } else {
            Status::Idle
        }
    }
}

struct QueryShared {
    cache: QueryCache,
    key: Arc<str>,
    query_fn: QueryFn,
    stale_time: Duration,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
    state: Mutex<QueryState>,
}

/// Reactive binding of one cache key to one consumer.
///
/// Clones share the same binding instance. Dropping the last clone drops
/// the cache subscription, except while a fetch is in flight: the fetch
/// task keeps the binding (and its subscription) alive until it settles.
#[derive(Clone)]
pub struct Query {
    shared: Arc<QueryShared>,
}

impl Query {
    /// Start building a query over `key` in `cache`, fetching with
    /// `query_fn`. The cache is a required argument: there is no implicit
    /// global store to reach for.
    pub fn builder<F, Fut>(
        cache: QueryCache,
        key: impl Into<Arc<str>>,
        query_fn: F,
    ) -> QueryBuilder
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        QueryBuilder {
            cache,
            key: key.into(),
            query_fn: Arc::new(move || Box::pin(query_fn())),
            stale_time: Duration::ZERO,
            enabled: true,
            on_success: None,
            on_error: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Last known value for this binding (possibly stale)
    pub fn data(&self) -> Option<Arc<Value>> {
        self.shared.state.lock().data.clone()
    }

    /// Last fetch error, surfaced alongside any stale data
    pub fn error(&self) -> Option<Arc<QueryError>> {
        self.shared.state.lock().error.clone()
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().status()
    }

    /// True while this binding's fetch is in flight
    pub fn is_fetching(&self) -> bool {
        self.shared.state.lock().fetch_status == FetchStatus::Fetching
    }

    pub fn is_loading(&self) -> bool {
        self.is_fetching()
    }

    pub fn is_error(&self) -> bool {
        self.status().is_error()
    }

    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Subscribe to the cache and run the first revalidation. Hosts call
    /// this on mount; calling it again is harmless.
    pub async fn attach(&self) {
        self.ensure_subscribed();
        self.revalidate().await;
    }

    /// Drop the cache subscription. An in-flight fetch still runs to
    /// completion and still writes the shared cache - other bindings on the
    /// same key keep benefiting from it.
    pub fn detach(&self) {
        let sub = self.shared.state.lock().subscription.take();
        drop(sub);
    }

    /// Enable or disable the binding. Disabling tears down the subscription
    /// and parks the binding at `Idle`; enabling re-subscribes and
    /// revalidates.
    pub async fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if !enabled {
                let sub = state.subscription.take();
                if state.fetch_status != FetchStatus::Fetching {
                    state.fetch_status = FetchStatus::Idle;
                }
                drop(state);
                drop(sub);
                return;
            }
        }
        self.ensure_subscribed();
        self.revalidate().await;
    }

    /// Re-evaluate this binding against the cache: sync the local view and
    /// fetch if the entry is stale, missing, or was never fetched. Hosts
    /// call this on any dependency change; it is also what a cache
    /// notification schedules.
    pub async fn revalidate(&self) {
        if self.shared.reconcile() {
            QueryShared::run_fetch(Arc::clone(&self.shared)).await;
        }
    }

    /// Force a fetch regardless of staleness, re-arming from a settled or
    /// error state. No-op while a fetch is already in flight.
    pub async fn refetch(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.fetch_status == FetchStatus::Fetching {
                return;
            }
            state.error = None;
            state.fetch_status = FetchStatus::Idle;
        }
        QueryShared::run_fetch(Arc::clone(&self.shared)).await;
    }

    /// Invalidate this binding's key in the shared cache and reset local
    /// fetch eligibility. Subscribed bindings (this one included) observe
    /// the cleared entry and revalidate.
    pub fn invalidate(&self) {
        self.shared.cache.invalidate(&self.shared.key);
        let mut state = self.shared.state.lock();
        state.error = None;
        if state.fetch_status != FetchStatus::Fetching {
            state.fetch_status = FetchStatus::Idle;
        }
    }

    /// Register the cache listener exactly once per enabled lifetime
    fn ensure_subscribed(&self) {
        let mut state = self.shared.state.lock();
        if state.subscription.is_some() || !state.enabled {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let sub = self
            .shared
            .cache
            .subscribe(&self.shared.key, move |data| {
                if let Some(shared) = weak.upgrade() {
                    QueryShared::on_cache_notify(&shared, data);
                }
            });
        state.subscription = Some(sub);
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .finish()
    }
}

impl QueryShared {
    /// Freshness: data present, no recorded error, a positive stale time,
    /// and age within it. `stale_time <= 0` means always stale.
    fn is_fresh(entry: &CacheEntry, stale_time: Duration, now_ms: u64) -> bool {
        if entry.data.is_none() || entry.error.is_some() {
            return false;
        }
        let stale_ms = stale_time.as_millis() as u64;
        if stale_ms == 0 {
            return false;
        }
        now_ms.saturating_sub(entry.timestamp_ms) <= stale_ms
    }

    /// Sync the local view from the shared entry and report whether a fetch
    /// is due. While a fetch is in flight this is a no-op (single-flight);
    /// the synchronous notify inside `set` keeps the local view from
    /// clobbering a fetch this binding just completed.
    fn reconcile(&self) -> bool {
        let entry = self.cache.get(&self.key);
        let now = self.cache.now_ms();
        let mut state = self.state.lock();
        if !state.enabled || state.fetch_status == FetchStatus::Fetching {
            return false;
        }

        let (data, error, fresh) = match entry {
            Some(e) => {
                let fresh = Self::is_fresh(&e, self.stale_time, now);
                (e.data, e.error, fresh)
            }
            None => (None, None, false),
        };
        let blocked = error.is_some();
        state.data = data;
        state.error = error;
        if fresh && state.fetch_status == FetchStatus::Idle && state.data.is_some() {
            state.fetch_status = FetchStatus::Settled;
        } else if !fresh
            && state.fetch_status == FetchStatus::Settled
            && !self.stale_time.is_zero()
        {
            // Aged-out freshness re-arms fetch eligibility. With a zero
            // stale time a settled fetch stays settled, otherwise every
            // settle would immediately schedule the next fetch.
            state.fetch_status = FetchStatus::Idle;
        }

        // A recorded cache error blocks automatic refetch; retry is an
        // explicit caller action (`refetch`).
        state.fetch_status == FetchStatus::Idle && !fresh && !blocked
    }

    /// Listener transitions, mirroring the write that triggered them
    fn on_cache_notify(shared: &Arc<Self>, data: Option<Arc<Value>>) {
        {
            let mut state = shared.state.lock();
            let was_fetching = state.fetch_status == FetchStatus::Fetching;
            let had_data = state.data.is_some();
            state.data = data.clone();
            if was_fetching {
                // The write that settles this binding's own in-flight fetch
                state.fetch_status = FetchStatus::Settled;
                state.error = None;
            } else if data.is_none() && had_data {
                state.fetch_status = FetchStatus::Idle;
            }
        }
        Self::schedule_revalidate(shared);
    }

    /// Run revalidation on the ambient runtime; used from the synchronous
    /// listener path where awaiting is impossible.
    fn schedule_revalidate(shared: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %shared.key, "no tokio runtime; skipping scheduled revalidation");
            return;
        };
        let shared = Arc::clone(shared);
        handle.spawn(async move {
            if shared.reconcile() {
                Self::run_fetch(shared).await;
            }
        });
    }

    /// Execute one fetch. The `Idle → Fetching` flip is atomic under the
    /// state lock, which is what guarantees single-flight per binding; the
    /// lock is never held across the await.
    #[instrument(skip(shared), fields(key = %shared.key))]
    async fn run_fetch(shared: Arc<Self>) {
        {
            let mut state = shared.state.lock();
            if state.fetch_status == FetchStatus::Fetching || !state.enabled {
                return;
            }
            state.fetch_status = FetchStatus::Fetching;
        }
        debug!("fetching");

        match (shared.query_fn)().await {
            Ok(value) => {
                let data = Arc::new(value);
                // Notifies listeners synchronously, this binding's included
                shared.cache.set(&shared.key, Arc::clone(&data));
                {
                    // Detached mid-flight: the listener no longer runs, so
                    // settle the local view here. A binding disabled
                    // mid-flight lands on `Idle` instead, keeping the next
                    // enable fetch-eligible.
                    let mut state = shared.state.lock();
                    if state.fetch_status == FetchStatus::Fetching {
                        state.data = Some(Arc::clone(&data));
                        state.error = None;
                        state.fetch_status = if state.enabled {
                            FetchStatus::Settled
                        } else {
                            FetchStatus::Idle
                        };
                    }
                }
                debug!("fetch succeeded");
                if let Some(hook) = &shared.on_success {
                    let hook = Arc::clone(hook);
                    run_hook("query.on_success", move || hook(&data));
                }
            }
            Err(err) => {
                let err = Arc::new(err);
                {
                    // Last good data stays visible (stale-while-error);
                    // Idle keeps the binding eligible for manual retry.
                    let mut state = shared.state.lock();
                    state.error = Some(Arc::clone(&err));
                    state.fetch_status = FetchStatus::Idle;
                }
                shared.cache.set_error(&shared.key, Arc::clone(&err));
                warn!(error = %err, "fetch failed");
                if let Some(hook) = &shared.on_error {
                    let hook = Arc::clone(hook);
                    run_hook("query.on_error", move || hook(&err));
                }
            }
        }
    }
}

/// Fluent builder for [`Query`]
pub struct QueryBuilder {
    cache: QueryCache,
    key: Arc<str>,
    query_fn: QueryFn,
    stale_time: Duration,
    enabled: bool,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl QueryBuilder {
    /// How long a cached value counts as fresh. Zero (the default) means
    /// the cache is always treated as stale.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Disabled bindings never subscribe and never fetch
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Side-effect callback fired after each successful fetch
    pub fn on_success(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Side-effect callback fired after each failed fetch
    pub fn on_error(mut self, hook: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Query {
        // Seed the local view from whatever the cache already holds, so a
        // binding constructed over stale data shows it immediately.
        let entry = self.cache.get(&self.key);
        let now = self.cache.now_ms();
        let (data, error, fresh) = match entry {
            Some(e) => {
                let fresh = QueryShared::is_fresh(&e, self.stale_time, now);
                (e.data, e.error, fresh)
            }
            None => (None, None, false),
        };
        let fetch_status = if self.enabled && fresh {
            FetchStatus::Settled
        } else {
            FetchStatus::Idle
        };

        Query {
            shared: Arc::new(QueryShared {
                cache: self.cache,
                key: self.key,
                query_fn: self.query_fn,
                stale_time: self.stale_time,
                on_success: self.on_success,
                on_error: self.on_error,
                state: Mutex::new(QueryState {
                    data,
                    error,
                    fetch_status,
                    enabled: self.enabled,
                    subscription: None,
                }),
            }),
        }
    }
}
