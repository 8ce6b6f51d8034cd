//! requery - stale-while-revalidate query and mutation bindings over a
//! shared in-process cache.
//!
//! Three pieces:
//! - [`QueryCache`]: keyed cache of fetch results with per-key listener
//!   fan-out; pure storage plus pub/sub, no fetching logic.
//! - [`Query`]: per-consumer binding that keeps its view of one cache key
//!   correct, fetching when the entry is stale or missing (single-flight
//!   per binding).
//! - [`Mutation`]: per-consumer effectful action that invalidates
//!   dependent cache keys on success.
//!
//! The cache is an explicit context object - construct one, clone it
//! (clones share state), and hand it to every binding that should share
//! results. There is no process-global instance.

pub mod error;
mod hooks;
pub mod keys;
pub mod mutation;
pub mod query;
pub mod status;
pub mod store;

pub use error::QueryError;
pub use keys::QueryKey;
pub use mutation::{Mutation, MutationBuilder};
pub use query::{Query, QueryBuilder};
pub use status::Status;
pub use store::{CacheEntry, QueryCache, Subscription};
