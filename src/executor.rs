//! Transaction Executor
//!
//! Runs the step loop for one transaction: cancellation checks at step
//! boundaries, per-step pre-state snapshots, timeout-raced attempts with
//! retry, and reverse-order compensation on failure. The executor sits at
//! the innermost position of the middleware chain; commit and the terminal
//! lifecycle events happen after the whole chain returns, so a middleware
//! failing on the exit path still triggers a full rollback.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::event::{EventBody, EventBus, TransactionOutcome};
use crate::middleware::{Middleware, MiddlewareContext, Next, Terminal};
use crate::state::{SagaState, StateManager};
use crate::transaction::{Step, StepContext, TransactionStatus};

struct RollbackEntry<S> {
    step_index: usize,
    pre: Option<S>,
}

/// Executes one transaction run
pub(crate) struct TransactionExecutor<S: SagaState, P> {
    name: Arc<str>,
    id: Arc<str>,
    steps: Arc<Vec<Step<S, P>>>,
    payload: Arc<P>,
    state: Arc<StateManager<S>>,
    bus: EventBus,
    config: SagaConfig,
    cancel: CancelToken,
    succeeded: Arc<Mutex<Vec<RollbackEntry<S>>>>,
    step_loop_ran: Arc<AtomicBool>,
}

impl<S: SagaState, P> Clone for TransactionExecutor<S, P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            id: self.id.clone(),
            steps: self.steps.clone(),
            payload: self.payload.clone(),
            state: self.state.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            succeeded: self.succeeded.clone(),
            step_loop_ran: self.step_loop_ran.clone(),
        }
    }
}

impl<S, P> TransactionExecutor<S, P>
where
    S: SagaState,
    P: Serialize + Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        steps: Vec<Step<S, P>>,
        payload: P,
        state: Arc<StateManager<S>>,
        bus: EventBus,
        config: SagaConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: Arc::from(name.as_str()),
            id: Arc::from(Uuid::new_v4().to_string().as_str()),
            steps: Arc::new(steps),
            payload: Arc::new(payload),
            state,
            bus,
            config,
            cancel,
            succeeded: Arc::new(Mutex::new(Vec::new())),
            step_loop_ran: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the transaction through `middlewares`. Commits and emits the
    /// success events when the whole chain returns Ok; otherwise rolls back
    /// and re-raises the failure.
    pub(crate) async fn run(self, middlewares: Vec<Arc<dyn Middleware<S>>>) -> Result<()> {
        let started = Instant::now();
        let payload_json = serde_json::to_value(&*self.payload).unwrap_or(serde_json::Value::Null);

        debug!(
            transaction = %self.name,
            id = %self.id,
            status = %TransactionStatus::Running,
            steps = self.steps.len(),
            "transaction dispatched"
        );
        self.bus.emit(EventBody::TransactionStart {
            transaction_name: self.name.to_string(),
            transaction_id: self.id.to_string(),
            payload: payload_json.clone(),
        });

        let s0 = self.state.snapshot();
        let payload_any: Arc<dyn Any + Send + Sync> = self.payload.clone();
        let ctx = MiddlewareContext::new(
            &self.name,
            &self.id,
            payload_json,
            payload_any,
            self.state.clone(),
            self.cancel.clone(),
        );

        let terminal: Terminal = {
            let executor = self.clone();
            let ctx = ctx.clone();
            Arc::new(move || {
                let executor = executor.clone();
                let ctx = ctx.clone();
                async move { executor.execute_steps(&ctx).await }.boxed()
            })
        };

        let chain: Arc<[Arc<dyn Middleware<S>>]> = Arc::from(middlewares);
        let mut result = Next::new(chain, terminal).run(ctx).await;

        if result.is_ok() && !self.step_loop_ran.load(Ordering::SeqCst) {
            result = Err(SagaError::MiddlewareAbort {
                reason: "middleware chain returned without executing the transaction".to_string(),
            });
        }

        match result {
            Ok(()) => {
                self.state.commit();
                let duration_ms = started.elapsed().as_millis() as u64;
                self.bus.emit(EventBody::TransactionSuccess {
                    transaction_name: self.name.to_string(),
                    transaction_id: self.id.to_string(),
                    duration_ms,
                });
                self.bus.emit(EventBody::TransactionComplete {
                    transaction_name: self.name.to_string(),
                    transaction_id: self.id.to_string(),
                    duration_ms,
                    outcome: TransactionOutcome::Success,
                });
                info!(
                    transaction = %self.name,
                    id = %self.id,
                    status = %TransactionStatus::Succeeded,
                    duration_ms,
                    "transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                self.rollback(s0, &err).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                self.bus.emit(EventBody::TransactionFail {
                    transaction_name: self.name.to_string(),
                    transaction_id: self.id.to_string(),
                    error: err.to_string(),
                    duration_ms,
                });
                self.bus.emit(EventBody::TransactionComplete {
                    transaction_name: self.name.to_string(),
                    transaction_id: self.id.to_string(),
                    duration_ms,
                    outcome: TransactionOutcome::Fail,
                });
                let status = if err.is_cancelled() {
                    TransactionStatus::Cancelled
                } else {
                    TransactionStatus::Failed
                };
                warn!(
                    transaction = %self.name,
                    id = %self.id,
                    status = %status,
                    duration_ms,
                    error = %err,
                    "transaction rolled back"
                );
                Err(err)
            }
        }
    }

    /// The step loop. Innermost call of the middleware chain.
    async fn execute_steps(&self, ctx: &MiddlewareContext<S>) -> Result<()> {
        self.step_loop_ran.store(true, Ordering::SeqCst);

        for (index, step) in self.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled_error());
            }
            ctx.set_current_step(Some(step.name.clone()));

            let pre = self.config.auto_snapshot.then(|| self.state.snapshot());
            self.bus.emit(EventBody::StepStart {
                step_name: step.name.clone(),
                transaction_id: self.id.to_string(),
                attempt: 1,
            });

            self.run_step_with_retry(step, pre.as_ref()).await?;

            self.succeeded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(RollbackEntry {
                    step_index: index,
                    pre,
                });
        }

        ctx.set_current_step(None);
        Ok(())
    }

    /// Run one step until it succeeds, exhausts its retries, or the
    /// transaction is cancelled. Restores the pre-step snapshot before every
    /// retry so each attempt sees clean state.
    async fn run_step_with_retry(&self, step: &Step<S, P>, pre: Option<&S>) -> Result<()> {
        let step_ctx = StepContext::new(
            self.state.clone(),
            self.payload.clone(),
            self.cancel.clone(),
        );
        let max_attempts = step.options.retries + 1;
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            match self.run_attempt(step, step_ctx.clone()).await {
                Ok(()) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(step = %step.name, attempt, duration_ms, "step succeeded");
                    self.bus.emit(EventBody::StepSuccess {
                        step_name: step.name.clone(),
                        transaction_id: self.id.to_string(),
                        duration_ms,
                    });
                    return Ok(());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Err(self.cancelled_error());
                    }
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    warn!(step = %step.name, attempt, error = %err, "step attempt failed, retrying");
                    self.bus.emit(EventBody::StepRetry {
                        step_name: step.name.clone(),
                        transaction_id: self.id.to_string(),
                        attempt,
                        error: err.to_string(),
                    });
                    if let Some(pre) = pre {
                        self.state.restore(pre.clone());
                    }
                    self.retry_delay(step).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt, raced against the step's timeout when one is set
    async fn run_attempt(&self, step: &Step<S, P>, step_ctx: StepContext<S, P>) -> Result<()> {
        let fut = (step.execute)(step_ctx);
        let outcome = match step.options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SagaError::Timeout {
                        step: step.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
            None => fut.await,
        };
        outcome.map_err(|source| SagaError::StepFailed {
            step: step.name.clone(),
            source,
        })
    }

    /// Sleep between retry attempts, aborting promptly on cancellation
    async fn retry_delay(&self, step: &Step<S, P>) -> Result<()> {
        let delay = step
            .options
            .retry_delay
            .unwrap_or(Duration::from_millis(self.config.retry_delay_ms));
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(self.cancelled_error()),
        }
    }

    /// Unwind succeeded steps in reverse order: restore each pre-step
    /// snapshot, run its compensation, and report. Compensation failures are
    /// captured in the `step:rollback` event and never stop the unwind.
    /// Finally restores the pre-transaction snapshot.
    async fn rollback(&self, s0: S, cause: &SagaError) {
        debug!(
            transaction = %self.name,
            id = %self.id,
            status = %TransactionStatus::RolledBack,
            error = %cause,
            "rolling back"
        );
        self.bus.emit(EventBody::TransactionRollback {
            transaction_name: self.name.to_string(),
            transaction_id: self.id.to_string(),
            error: cause.to_string(),
        });

        let entries: Vec<RollbackEntry<S>> = {
            let mut succeeded = self
                .succeeded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            succeeded.drain(..).rev().collect()
        };

        for entry in entries {
            let step = &self.steps[entry.step_index];
            if let Some(pre) = entry.pre {
                self.state.restore(pre);
            }

            let compensation_error = match &step.compensate {
                Some(compensate) => {
                    let step_ctx = StepContext::new(
                        self.state.clone(),
                        self.payload.clone(),
                        self.cancel.clone(),
                    );
                    match compensate(step_ctx).await {
                        Ok(()) => None,
                        Err(source) => {
                            let err = SagaError::Compensation {
                                step: step.name.clone(),
                                source,
                            };
                            warn!(step = %step.name, error = %err, "compensation failed");
                            Some(err.to_string())
                        }
                    }
                }
                None => None,
            };

            self.bus.emit(EventBody::StepRollback {
                step_name: step.name.clone(),
                transaction_id: self.id.to_string(),
                compensation_error,
            });
        }

        // Safety net: guarantee the pre-transaction state even if a
        // compensation failed or snapshots were disabled.
        self.state.restore(s0);
    }

    fn cancelled_error(&self) -> SagaError {
        SagaError::Cancelled {
            transaction: self.name.to_string(),
        }
    }
}
