//! Store module - shared cache state.
//!
//! Thread-safe storage for fetch results with per-key listener fan-out.
//! Uses DashMap for lock-free concurrent access.
//!
//! Key types:
//! - `QueryCache`: shared key → entry map with change notification
//! - `CacheEntry`: snapshot of one entry (data, timestamp, error)
//! - `Subscription`: RAII listener registration

mod cache;

pub use cache::{CacheEntry, Listener, QueryCache, Subscription};
