//! Saga Manager
//!
//! The facade owning every core component: the versioned state manager, the
//! event bus, the middleware chain, the selector registry, and the run lock
//! that serializes transactions. Cloning a manager clones a handle to the
//! same instance. Disposing it tears everything down; afterwards every
//! operation fails with [`SagaError::Disposed`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::event::{EventBus, EventKind, SagaEvent};
use crate::middleware::Middleware;
use crate::selector::{Computed, Detach, Selector, SelectorOptions};
use crate::state::{SagaState, StateManager};
use crate::subscription::Subscription;
use crate::transaction::{Step, TransactionBuilder};
use crate::executor::TransactionExecutor;

struct ManagerInner<S: SagaState> {
    config: SagaConfig,
    state: Arc<StateManager<S>>,
    bus: EventBus,
    middlewares: Mutex<Vec<Arc<dyn Middleware<S>>>>,
    selectors: Mutex<Vec<Weak<dyn Detach>>>,
    run_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    devtools_tap: Mutex<Option<Subscription>>,
}

/// Facade over the saga core. Cheap to clone; all clones share one instance.
pub struct SagaManager<S: SagaState> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: SagaState> Clone for SagaManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SagaState> SagaManager<S> {
    /// Create a manager over `initial` state with default configuration
    pub fn new(initial: S) -> Self {
        Self::with_config(initial, SagaConfig::default())
    }

    /// Create a manager with explicit configuration
    pub fn with_config(initial: S, config: SagaConfig) -> Self {
        let bus = EventBus::new();
        let devtools_tap = if config.enable_dev_tools {
            Some(bus.on_any(|event: &SagaEvent| {
                debug!(kind = %event.kind(), event = ?event.body, "saga event");
            }))
        } else {
            None
        };

        let manager = Self {
            inner: Arc::new(ManagerInner {
                state: Arc::new(StateManager::new(initial, config.max_history_size)),
                bus,
                middlewares: Mutex::new(Vec::new()),
                selectors: Mutex::new(Vec::new()),
                run_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                devtools_tap: Mutex::new(devtools_tap),
                config,
            }),
        };
        debug!("saga manager created");
        manager
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SagaError::Disposed);
        }
        Ok(())
    }

    /// Begin building a named transaction with payload type `P`
    pub fn create_transaction<P>(&self, name: &str) -> TransactionBuilder<S, P>
    where
        P: Serialize + Send + Sync + 'static,
    {
        TransactionBuilder::new(self.clone(), name)
    }

    /// Register a middleware. Middlewares wrap every subsequent transaction
    /// in registration order.
    pub fn use_middleware(&self, middleware: impl Middleware<S> + 'static) -> Result<()> {
        self.ensure_live()?;
        self.inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(middleware));
        Ok(())
    }

    /// Deep-cloned view of the current state
    pub fn get_state(&self) -> Result<S> {
        self.ensure_live()?;
        Ok(self.inner.state.get_state())
    }

    /// Number of commits since creation
    pub fn committed_version(&self) -> Result<u64> {
        self.ensure_live()?;
        Ok(self.inner.state.version())
    }

    /// Step back one committed snapshot. Returns whether anything changed.
    pub fn undo(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.inner.state.undo())
    }

    /// Step forward one committed snapshot. Returns whether anything changed.
    pub fn redo(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.inner.state.redo())
    }

    /// Subscribe to one lifecycle event kind
    pub fn on_event(
        &self,
        kind: EventKind,
        listener: impl Fn(&SagaEvent) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        Ok(self.inner.bus.on(kind, listener))
    }

    /// Subscribe to every lifecycle event
    pub fn on_any_event(
        &self,
        listener: impl Fn(&SagaEvent) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        Ok(self.inner.bus.on_any(listener))
    }

    /// Create a memoized selector over the state using structural equality
    pub fn select<T>(&self, projection: impl Fn(&S) -> T + Send + Sync + 'static) -> Result<Selector<S, T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.select_with(projection, SelectorOptions::default())
    }

    /// Create a selector with explicit options, using structural equality
    pub fn select_with<T>(
        &self,
        projection: impl Fn(&S) -> T + Send + Sync + 'static,
        options: SelectorOptions,
    ) -> Result<Selector<S, T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.select_with_equality(projection, |a: &T, b: &T| a == b, options)
    }

    /// Create a selector with a custom equality function
    pub fn select_with_equality<T>(
        &self,
        projection: impl Fn(&S) -> T + Send + Sync + 'static,
        equality: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        options: SelectorOptions,
    ) -> Result<Selector<S, T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let selector = Selector::new(
            self.inner.state.clone(),
            self.inner.bus.clone(),
            projection,
            equality,
            options,
        );
        self.register_detach(selector.detach_handle());
        Ok(selector)
    }

    /// Combine several selectors into a derived value with structural
    /// equality on the result
    pub fn compute<U, T>(
        &self,
        sources: Vec<Selector<S, U>>,
        combine: impl Fn(&[U]) -> T + Send + Sync + 'static,
    ) -> Result<Computed<S, U, T>>
    where
        U: Clone + Send + Sync + 'static,
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let computed = Computed::new(
            sources,
            combine,
            |a: &T, b: &T| a == b,
            "computed".to_string(),
        );
        self.register_detach(computed.detach_handle());
        Ok(computed)
    }

    fn register_detach(&self, handle: Weak<dyn Detach>) {
        let mut selectors = self
            .inner
            .selectors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        selectors.retain(|weak| weak.strong_count() > 0);
        selectors.push(handle);
    }

    /// Tear down the manager: detach selectors, clear middlewares, dispose
    /// the event bus and the state manager. Idempotent. Afterwards every
    /// operation fails with [`SagaError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<Weak<dyn Detach>> = {
            let mut selectors = self
                .inner
                .selectors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            selectors.drain(..).collect()
        };
        for handle in handles {
            if let Some(selector) = handle.upgrade() {
                selector.force_detach();
            }
        }

        self.inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        if let Some(tap) = self
            .inner
            .devtools_tap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            tap.dispose();
        }
        self.inner.bus.dispose();
        self.inner.state.dispose();
        info!("saga manager disposed");
    }

    pub(crate) async fn run_transaction<P>(
        &self,
        name: String,
        steps: Vec<Step<S, P>>,
        cancel: CancelToken,
        payload: P,
    ) -> Result<()>
    where
        P: Serialize + Send + Sync + 'static,
    {
        self.ensure_live()?;

        // Serialize transactions: queue FIFO on the fair lock, or fail fast
        // when queueing is disabled.
        let _guard = if self.inner.config.queue_transactions {
            self.inner.run_lock.lock().await
        } else {
            match self.inner.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Err(SagaError::Busy),
            }
        };
        // The manager may have been disposed while this run was queued.
        self.ensure_live()?;

        let middlewares: Vec<Arc<dyn Middleware<S>>> = self
            .inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let executor = TransactionExecutor::new(
            name,
            steps,
            payload,
            self.inner.state.clone(),
            self.inner.bus.clone(),
            self.inner.config.clone(),
            cancel,
        );
        executor.run(middlewares).await
    }
}
