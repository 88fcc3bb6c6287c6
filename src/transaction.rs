//! Transactions, Steps, and the Builder
//!
//! A transaction is an ordered list of steps, each an async operation over
//! the shared state with an optional compensation that semantically undoes
//! it. Steps are built as values and accumulated on a [`TransactionBuilder`]
//! obtained from the saga manager; `run` hands them to the executor through
//! the middleware chain.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Result, StepError};
use crate::manager::SagaManager;
use crate::state::{SagaState, StateManager};

/// Lifecycle states of a transaction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Created, not yet started
    Pending,
    /// Step loop in progress
    Running,
    /// All steps completed and the result was committed
    Succeeded,
    /// A step failed and rollback completed
    Failed,
    /// Cancelled before completion and rolled back
    Cancelled,
    /// Rollback in progress
    RolledBack,
}

impl TransactionStatus {
    /// Whether the transaction reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Succeeded | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Running => write!(f, "running"),
            TransactionStatus::Succeeded => write!(f, "succeeded"),
            TransactionStatus::Failed => write!(f, "failed"),
            TransactionStatus::Cancelled => write!(f, "cancelled"),
            TransactionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Advisory scheduling hint carried on step options. The executor never
/// reorders steps; the hint is passed through to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for StepPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPriority::Low => write!(f, "low"),
            StepPriority::Normal => write!(f, "normal"),
            StepPriority::High => write!(f, "high"),
        }
    }
}

/// Per-step execution options
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Additional attempts after a failure (default: 0)
    pub retries: u32,
    /// Wall-clock limit per attempt (default: unlimited)
    pub timeout: Option<Duration>,
    /// Delay before a retry attempt; falls back to the manager-wide
    /// `retry_delay_ms` when unset
    pub retry_delay: Option<Duration>,
    /// Advisory priority metadata
    pub priority: StepPriority,
}

/// Execution context handed to step and compensation bodies
pub struct StepContext<S, P> {
    state: Arc<StateManager<S>>,
    payload: Arc<P>,
    cancel: CancelToken,
}

impl<S, P> Clone for StepContext<S, P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            payload: self.payload.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: SagaState, P> StepContext<S, P> {
    pub(crate) fn new(state: Arc<StateManager<S>>, payload: Arc<P>, cancel: CancelToken) -> Self {
        Self {
            state,
            payload,
            cancel,
        }
    }

    /// Deep-cloned view of the working state
    pub fn state(&self) -> S {
        self.state.get_state()
    }

    /// Mutate the working state in place. Changes become visible to later
    /// steps immediately and are committed only if the whole transaction
    /// succeeds.
    pub fn update(&self, f: impl FnOnce(&mut S)) {
        self.state.update(f);
    }

    /// The payload this transaction was run with
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Whether cancellation of the enclosing transaction was requested.
    /// Long-running step bodies should poll this or await [`Self::cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

pub(crate) type StepFn<S, P> =
    Arc<dyn Fn(StepContext<S, P>) -> BoxFuture<'static, std::result::Result<(), StepError>> + Send + Sync>;

fn erase_step_fn<S, P, F, Fut, E>(f: F) -> StepFn<S, P>
where
    S: SagaState,
    P: Send + Sync + 'static,
    F: Fn(StepContext<S, P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<StepError>,
{
    Arc::new(move |ctx| f(ctx).map(|r| r.map_err(Into::into)).boxed())
}

/// One unit of work inside a transaction
pub struct Step<S, P> {
    pub(crate) name: String,
    pub(crate) execute: StepFn<S, P>,
    pub(crate) compensate: Option<StepFn<S, P>>,
    pub(crate) options: StepOptions,
}

impl<S: SagaState, P: Send + Sync + 'static> Step<S, P> {
    /// Create a step from an async operation
    pub fn new<F, Fut, E>(name: &str, execute: F) -> Self
    where
        F: Fn(StepContext<S, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<StepError>,
    {
        Self {
            name: name.to_string(),
            execute: erase_step_fn(execute),
            compensate: None,
            options: StepOptions::default(),
        }
    }

    /// Attach a compensation that semantically undoes this step during
    /// rollback
    pub fn with_compensation<F, Fut, E>(mut self, compensate: F) -> Self
    where
        F: Fn(StepContext<S, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<StepError>,
    {
        self.compensate = Some(erase_step_fn(compensate));
        self
    }

    /// Retry the step up to `retries` additional times on failure
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    /// Limit each attempt to `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Wait `delay` before each retry attempt
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry_delay = Some(delay);
        self
    }

    /// Advisory priority hint
    pub fn with_priority(mut self, priority: StepPriority) -> Self {
        self.options.priority = priority;
        self
    }

    /// Step name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Accumulates steps for a named transaction and runs them
pub struct TransactionBuilder<S: SagaState, P> {
    manager: SagaManager<S>,
    name: String,
    steps: Vec<Step<S, P>>,
    cancel: CancelToken,
}

impl<S, P> TransactionBuilder<S, P>
where
    S: SagaState,
    P: Serialize + Send + Sync + 'static,
{
    pub(crate) fn new(manager: SagaManager<S>, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
            steps: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Append a step
    pub fn add_step(mut self, step: Step<S, P>) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a plain step without compensation or options
    pub fn add_simple_step<F, Fut, E>(self, name: &str, execute: F) -> Self
    where
        F: Fn(StepContext<S, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<StepError>,
    {
        self.add_step(Step::new(name, execute))
    }

    /// Append a synchronous, infallible state mutation that ignores the
    /// payload
    pub fn add_void_step<F>(self, name: &str, mutate: F) -> Self
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        self.add_step(Step::new(name, move |ctx: StepContext<S, P>| {
            ctx.update(&mutate);
            std::future::ready(Ok::<(), StepError>(()))
        }))
    }

    /// Token that cancels this transaction when fired. Clone it before
    /// calling [`Self::run`] to cancel from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of accumulated steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Execute the transaction with `payload` through the manager's
    /// middleware chain. Resolves after commit on success, or after full
    /// rollback with the original failure on error.
    pub async fn run(self, payload: P) -> Result<()> {
        self.manager
            .run_transaction(self.name, self.steps, self.cancel, payload)
            .await
    }
}
