//! QueryCache - shared fetch-result storage with listener fan-out.
//!
//! Single DashMap design with lock-free concurrent access. Per-entry
//! mutation happens under the shard guard; listener callbacks are
//! snapshotted first and run after the guard is dropped, so a listener may
//! re-enter the cache without deadlocking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::QueryError;

/// Listener callback, invoked with the entry's data on every write or
/// invalidation (`None` = invalidated or never fetched).
pub type Listener = Arc<dyn Fn(Option<Arc<Value>>) + Send + Sync>;

/// Snapshot of one cache entry (listeners excluded).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Last successfully fetched value, if any
    pub data: Option<Arc<Value>>,
    /// Milliseconds since the cache was created; `0` = never written
    pub timestamp_ms: u64,
    /// Last fetch error; cleared on the next successful write. May coexist
    /// with stale `data` (stale-while-error) - callers decide precedence.
    pub error: Option<Arc<QueryError>>,
}

/// Internal slot: the snapshot fields plus the listener table.
struct EntrySlot {
    data: Option<Arc<Value>>,
    timestamp_ms: u64,
    error: Option<Arc<QueryError>>,
    listeners: Vec<(u64, Listener)>,
}

impl EntrySlot {
    fn empty() -> Self {
        Self {
            data: None,
            timestamp_ms: 0,
            error: None,
            listeners: Vec::new(),
        }
    }

    fn snapshot(&self) -> CacheEntry {
        CacheEntry {
            data: self.data.clone(),
            timestamp_ms: self.timestamp_ms,
            error: self.error.clone(),
        }
    }

    fn listener_snapshot(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct CacheInner {
    /// Cache entries: key → slot
    entries: DashMap<Arc<str>, EntrySlot>,
    /// Timestamp origin; entry ages are measured against this clock
    start: Instant,
    next_listener_id: AtomicU64,
}

/// Shared cache of fetch results keyed by opaque strings.
///
/// Cheap to clone; clones share the same underlying map. There is no
/// implicit global instance - construct one and pass it to the bindings
/// that should share it.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                start: Instant::now(),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// Milliseconds elapsed on this cache's clock
    pub(crate) fn now_ms(&self) -> u64 {
        self.inner.start.elapsed().as_millis() as u64
    }

    /// Snapshot an entry. No side effects.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|slot| slot.snapshot())
    }

    /// Write a successful fetch result: overwrites data, clears any error,
    /// stamps the timestamp, preserves the listener table, then
    /// synchronously notifies every listener with the new data. Creates the
    /// entry if none existed.
    pub fn set(&self, key: &str, value: impl Into<Arc<Value>>) {
        let data = value.into();
        let listeners = {
            let mut slot = self
                .inner
                .entries
                .entry(Arc::from(key))
                .or_insert_with(EntrySlot::empty);
            slot.data = Some(Arc::clone(&data));
            slot.error = None;
            // 0 stays reserved for "never written"
            slot.timestamp_ms = self.now_ms().max(1);
            slot.listener_snapshot()
        };
        debug!(key, listeners = listeners.len(), "cache set");
        Self::notify(&listeners, Some(data));
    }

    /// Record a failed revalidation: the last good value and its timestamp
    /// survive, the error is stored, and listeners are notified with the
    /// unchanged data so sibling bindings re-evaluate and observe it.
    pub fn set_error(&self, key: &str, error: impl Into<Arc<QueryError>>) {
        let error = error.into();
        let (data, listeners) = {
            let mut slot = self
                .inner
                .entries
                .entry(Arc::from(key))
                .or_insert_with(EntrySlot::empty);
            slot.error = Some(Arc::clone(&error));
            (slot.data.clone(), slot.listener_snapshot())
        };
        debug!(key, error = %error, "cache error recorded");
        Self::notify(&listeners, data);
    }

    /// Invalidate a key. With listeners the entry survives cleared (data,
    /// error, and timestamp reset) and everyone is told with `None`; with
    /// zero listeners the entry is removed silently - no one is watching.
    pub fn invalidate(&self, key: &str) {
        let listeners = {
            let Some(mut slot) = self.inner.entries.get_mut(key) else {
                return;
            };
            if slot.listeners.is_empty() {
                None
            } else {
                slot.data = None;
                slot.error = None;
                slot.timestamp_ms = 0;
                Some(slot.listener_snapshot())
            }
        };
        match listeners {
            None => {
                self.inner.entries.remove(key);
                debug!(key, "cache entry removed (no listeners)");
            }
            Some(listeners) => {
                debug!(key, listeners = listeners.len(), "cache entry invalidated");
                Self::notify(&listeners, None);
            }
        }
    }

    /// Register a listener for a key, lazily creating an empty entry.
    /// Dropping the returned [`Subscription`] deregisters it; independent
    /// subscriptions to the same key never interfere.
    pub fn subscribe(
        &self,
        key: &str,
        callback: impl Fn(Option<Arc<Value>>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let key: Arc<str> = Arc::from(key);
        self.inner
            .entries
            .entry(Arc::clone(&key))
            .or_insert_with(EntrySlot::empty)
            .listeners
            .push((id, Arc::new(callback)));
        Subscription {
            cache: self.clone(),
            key,
            id,
        }
    }

    /// Check if a key has an entry (written or listener-created)
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan out to a listener snapshot. A panicking listener is logged and
    /// skipped; delivery continues to the rest.
    fn notify(listeners: &[Listener], data: Option<Arc<Value>>) {
        for listener in listeners {
            let payload = data.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                warn!("cache listener panicked during fan-out");
            }
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// RAII handle for one listener registration; dropping it unsubscribes.
///
/// When the last listener leaves and the entry holds no data or error, the
/// entry itself is removed.
#[must_use = "dropping the subscription unregisters the listener"]
pub struct Subscription {
    cache: QueryCache,
    key: Arc<str>,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remove_entry = {
            let Some(mut slot) = self.cache.inner.entries.get_mut(&self.key) else {
                return;
            };
            slot.listeners.retain(|(id, _)| *id != self.id);
            slot.listeners.is_empty() && slot.data.is_none() && slot.error.is_none()
        };
        if remove_entry {
            self.cache.inner.entries.remove(&self.key);
        }
    }
}
