//! Middleware Orchestration
//!
//! Middlewares wrap transaction execution onion-style: entry code runs in
//! registration order, the innermost [`Next`] invokes the executor's step
//! loop, and exit code runs in reverse. `Next` is consumed by [`Next::run`],
//! so a middleware can continue the chain at most once; returning without
//! continuing aborts the transaction.

mod logging;
mod persistence;

pub use logging::LoggingMiddleware;
pub use persistence::{
    load_persisted_state, MemorySnapshotStore, PersistenceMiddleware, SnapshotStore,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::error::{Result, SagaError};
use crate::state::{SagaState, StateManager};

/// Cross-cutting wrapper around transaction execution
#[async_trait]
pub trait Middleware<S: SagaState>: Send + Sync {
    /// Wrap the rest of the chain. Implementations await `next.run(ctx)`
    /// exactly once to continue; returning an error (or [`MiddlewareContext::
    /// abort`]) unwinds the chain and triggers rollback.
    async fn handle(&self, ctx: MiddlewareContext<S>, next: Next<S>) -> Result<()>;
}

/// Read-mostly view of the running transaction handed to middlewares
pub struct MiddlewareContext<S> {
    transaction_name: Arc<str>,
    transaction_id: Arc<str>,
    payload_json: Arc<serde_json::Value>,
    payload_any: Arc<dyn Any + Send + Sync>,
    state: Arc<StateManager<S>>,
    current_step: Arc<Mutex<Option<String>>>,
    cancel: CancelToken,
}

impl<S> Clone for MiddlewareContext<S> {
    fn clone(&self) -> Self {
        Self {
            transaction_name: self.transaction_name.clone(),
            transaction_id: self.transaction_id.clone(),
            payload_json: self.payload_json.clone(),
            payload_any: self.payload_any.clone(),
            state: self.state.clone(),
            current_step: self.current_step.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: SagaState> MiddlewareContext<S> {
    pub(crate) fn new(
        transaction_name: &str,
        transaction_id: &str,
        payload_json: serde_json::Value,
        payload_any: Arc<dyn Any + Send + Sync>,
        state: Arc<StateManager<S>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transaction_name: Arc::from(transaction_name),
            transaction_id: Arc::from(transaction_id),
            payload_json: Arc::new(payload_json),
            payload_any,
            state,
            current_step: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Name of the running transaction
    pub fn transaction_name(&self) -> &str {
        &self.transaction_name
    }

    /// Unique id of this run
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Payload serialized at run start
    pub fn payload_json(&self) -> &serde_json::Value {
        &self.payload_json
    }

    /// Typed payload access
    pub fn payload<P: Send + Sync + 'static>(&self) -> Option<Arc<P>> {
        self.payload_any.clone().downcast::<P>().ok()
    }

    /// Deep-cloned view of the working state
    pub fn state(&self) -> S {
        self.state.get_state()
    }

    /// Mutate the working state through the state manager. Does not commit.
    pub fn update(&self, f: impl FnOnce(&mut S)) {
        self.state.update(f);
    }

    /// Name of the step currently being dispatched, if any
    pub fn current_step(&self) -> Option<String> {
        self.current_step
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_current_step(&self, step: Option<String>) {
        *self
            .current_step
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = step;
    }

    /// Whether cancellation of this transaction was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build the abort error for this transaction. Return it from a
    /// middleware to unwind the chain and roll back:
    ///
    /// ```ignore
    /// return Err(ctx.abort("quota exceeded"));
    /// ```
    pub fn abort(&self, reason: &str) -> SagaError {
        SagaError::MiddlewareAbort {
            reason: reason.to_string(),
        }
    }
}

pub(crate) type Terminal = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Continuation of the middleware chain. Consumed by [`Next::run`]; the
/// innermost continuation invokes the transaction executor's step loop.
pub struct Next<S: SagaState> {
    chain: Arc<[Arc<dyn Middleware<S>>]>,
    index: usize,
    terminal: Terminal,
}

impl<S: SagaState> Next<S> {
    pub(crate) fn new(chain: Arc<[Arc<dyn Middleware<S>>]>, terminal: Terminal) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// Run the rest of the chain
    pub async fn run(self, ctx: MiddlewareContext<S>) -> Result<()> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Self {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                middleware.handle(ctx, next).await
            }
            None => (self.terminal)().await,
        }
    }
}

/// Adapt an async closure into a [`Middleware`]
pub fn from_fn<S, F, Fut>(f: F) -> FnMiddleware<F>
where
    S: SagaState,
    F: Fn(MiddlewareContext<S>, Next<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnMiddleware(f)
}

/// Closure-backed middleware created by [`from_fn`]
pub struct FnMiddleware<F>(F);

#[async_trait]
impl<S, F, Fut> Middleware<S> for FnMiddleware<F>
where
    S: SagaState,
    F: Fn(MiddlewareContext<S>, Next<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        (self.0)(ctx, next).await
    }
}
