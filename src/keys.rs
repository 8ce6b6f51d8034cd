//! Hierarchical cache-key construction.
//!
//! Cache keys are opaque strings as far as the store is concerned. UIs
//! addressing REST-shaped resource trees (worlds → continents → zones →
//! locations) benefit from a builder that renders stable `a/b/c` keys
//! instead of hand-assembled format strings at every call site.

use std::fmt;
use std::sync::Arc;

/// Builder for slash-joined cache keys.
///
/// ```
/// use requery::QueryKey;
///
/// let key = QueryKey::new("worlds").push(42).push("zones");
/// assert_eq!(key.to_string(), "worlds/42/zones");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    segments: Vec<String>,
}

impl QueryKey {
    /// Start a key at its root segment
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            segments: vec![root.into()],
        }
    }

    /// Append a path segment (ids, resource names, anything displayable)
    pub fn push(mut self, segment: impl fmt::Display) -> Self {
        self.segments.push(segment.to_string());
        self
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<QueryKey> for String {
    fn from(key: QueryKey) -> Self {
        key.to_string()
    }
}

impl From<QueryKey> for Arc<str> {
    fn from(key: QueryKey) -> Self {
        Arc::from(key.to_string())
    }
}
