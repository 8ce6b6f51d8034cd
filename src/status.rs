//! Public binding status.

use serde::Serialize;

/// Observable lifecycle of a query or mutation binding.
///
/// For queries this is always derived from the underlying fetch status,
/// local error, and local data; it is never stored as independent truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Nothing fetched yet and nothing in flight
    Idle,
    /// A fetch or mutation is in flight
    Loading,
    /// Last operation settled with data
    Success,
    /// Last operation failed; the error is surfaced alongside any stale data
    Error,
}

impl Status {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
