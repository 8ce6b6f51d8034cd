//! Error types for query and mutation execution.
//!
//! Fetch and mutation failures are stored verbatim (as `Arc<QueryError>`)
//! in cache entries and binding state, never wrapped or retried by the
//! core. Only side-effect callbacks get their failures swallowed.

use thiserror::Error;

/// Errors surfaced by supplied fetch/mutation functions, or raised at the
/// caller's seam while decoding a cached payload.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("mutation failed: {0}")]
    Mutation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    /// Build a fetch error from any displayable source
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Build a mutation error from any displayable source
    pub fn mutation(message: impl Into<String>) -> Self {
        Self::Mutation(message.into())
    }

    /// Human-readable message without the variant prefix (what UIs show in
    /// error banners)
    pub fn message(&self) -> String {
        match self {
            Self::Fetch(m) | Self::Mutation(m) => m.clone(),
            Self::Json(e) => e.to_string(),
        }
    }
}
