//! Mutation binding - single-flight write operations with cache
//! invalidation.
//!
//! A `Mutation` runs one effectful operation at a time, tracks its own
//! lifecycle independently of any cache key, and on success invalidates
//! the configured keys in declaration order. Each invalidation triggers
//! revalidation in whatever query bindings watch that key.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::QueryError;
use crate::hooks::run_hook;
use crate::status::Status;
use crate::store::QueryCache;

type MutationFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, QueryError>> + Send + Sync>;
type SuccessHook = Arc<dyn Fn(Option<&Value>, &[Value]) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&QueryError, &[Value]) + Send + Sync>;

struct MutationState {
    data: Option<Arc<Value>>,
    error: Option<Arc<QueryError>>,
    status: Status,
    /// Bumped by every `mutate` and `reset`; a settling operation whose
    /// generation no longer matches applies nothing. This closes the
    /// late-resolution-after-reset race.
    generation: u64,
}

struct MutationShared {
    cache: QueryCache,
    mutation_fn: MutationFn,
    invalidate_keys: Vec<Arc<str>>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
    state: Mutex<MutationState>,
}

/// One logical write operation and its observable lifecycle.
///
/// Clones share the same binding instance.
#[derive(Clone)]
pub struct Mutation {
    shared: Arc<MutationShared>,
}

impl Mutation {
    /// Start building a mutation running `mutation_fn`, invalidating into
    /// `cache` on success.
    pub fn builder<F, Fut>(cache: QueryCache, mutation_fn: F) -> MutationBuilder
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, QueryError>> + Send + 'static,
    {
        MutationBuilder {
            cache,
            mutation_fn: Arc::new(move |args| Box::pin(mutation_fn(args))),
            invalidate_keys: Vec::new(),
            on_success: None,
            on_error: None,
        }
    }

    /// Value returned by the last successful mutation, if any
    pub fn data(&self) -> Option<Arc<Value>> {
        self.shared.state.lock().data.clone()
    }

    pub fn error(&self) -> Option<Arc<QueryError>> {
        self.shared.state.lock().error.clone()
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().status
    }

    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    pub fn is_error(&self) -> bool {
        self.status().is_error()
    }

    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Run the mutation with positional `args`. Calls made while one is
    /// already in flight are dropped, not queued.
    #[instrument(skip_all)]
    pub async fn mutate(&self, args: Vec<Value>) {
        let generation = {
            let mut state = self.shared.state.lock();
            if state.status == Status::Loading {
                debug!("mutation already in flight; call dropped");
                return;
            }
            state.status = Status::Loading;
            state.error = None;
            state.generation += 1;
            state.generation
        };

        let result = (self.shared.mutation_fn)(args.clone()).await;

        match result {
            Ok(value) => {
                let data = value.map(Arc::new);
                {
                    let mut state = self.shared.state.lock();
                    if state.generation != generation {
                        debug!("mutation settled after reset; result discarded");
                        return;
                    }
                    state.data = data.clone();
                    state.error = None;
                    state.status = Status::Success;
                }
                debug!("mutation succeeded");
                if let Some(hook) = &self.shared.on_success {
                    let hook = Arc::clone(hook);
                    let payload = data.clone();
                    let args = args.clone();
                    run_hook("mutation.on_success", move || {
                        hook(payload.as_deref(), &args)
                    });
                }
                for key in &self.shared.invalidate_keys {
                    debug!(key = %key, "invalidating after mutation");
                    self.shared.cache.invalidate(key);
                }
            }
            Err(err) => {
                let err = Arc::new(err);
                {
                    let mut state = self.shared.state.lock();
                    if state.generation != generation {
                        debug!("mutation failed after reset; error discarded");
                        return;
                    }
                    state.error = Some(Arc::clone(&err));
                    state.status = Status::Error;
                }
                warn!(error = %err, "mutation failed");
                if let Some(hook) = &self.shared.on_error {
                    let hook = Arc::clone(hook);
                    let args = args.clone();
                    run_hook("mutation.on_error", move || hook(&err, &args));
                }
            }
        }
    }

    /// Return to `Idle`, clearing data and error. Callable mid-flight: an
    /// in-flight `mutation_fn` is not cancelled, but its late settle is
    /// voided by the generation guard.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.data = None;
        state.error = None;
        state.status = Status::Idle;
    }
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("status", &self.status())
            .field("invalidate_keys", &self.shared.invalidate_keys)
            .finish()
    }
}

/// Fluent builder for [`Mutation`]
pub struct MutationBuilder {
    cache: QueryCache,
    mutation_fn: MutationFn,
    invalidate_keys: Vec<Arc<str>>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl MutationBuilder {
    /// Add one cache key to invalidate after a successful mutation.
    /// Keys are invalidated in the order they were added.
    pub fn invalidate_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.invalidate_keys.push(key.into());
        self
    }

    /// Add several invalidation keys at once
    pub fn invalidate_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.invalidate_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Side-effect callback fired with the result and the original
    /// arguments after each successful mutation
    pub fn on_success(
        mut self,
        hook: impl Fn(Option<&Value>, &[Value]) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Side-effect callback fired with the error and the original
    /// arguments after each failed mutation
    pub fn on_error(
        mut self,
        hook: impl Fn(&QueryError, &[Value]) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Mutation {
        Mutation {
            shared: Arc::new(MutationShared {
                cache: self.cache,
                mutation_fn: self.mutation_fn,
                invalidate_keys: self.invalidate_keys,
                on_success: self.on_success,
                on_error: self.on_error,
                state: Mutex::new(MutationState {
                    data: None,
                    error: None,
                    status: Status::Idle,
                    generation: 0,
                }),
            }),
        }
    }
}
