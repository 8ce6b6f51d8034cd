//! Side-effect callback plumbing shared by the bindings.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

/// Run an `on_success`/`on_error` callback, containing any panic.
///
/// Callback failures must never corrupt binding state or mask the primary
/// result, so they are logged and dropped.
pub(crate) fn run_hook(context: &'static str, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(context, "binding callback panicked; ignored");
    }
}
