//! Saga Event Bus
//!
//! Synchronous pub/sub for transaction lifecycle events. Listeners register
//! by event kind or for every event, are invoked in registration order, and
//! are isolated from each other: a panicking listener never prevents delivery
//! to the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::subscription::Subscription;

/// Event kinds emitted by the transaction executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TransactionStart,
    TransactionSuccess,
    TransactionFail,
    TransactionComplete,
    TransactionRollback,
    StepStart,
    StepSuccess,
    StepRetry,
    StepRollback,
    SelectorError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::TransactionStart => write!(f, "transaction:start"),
            EventKind::TransactionSuccess => write!(f, "transaction:success"),
            EventKind::TransactionFail => write!(f, "transaction:fail"),
            EventKind::TransactionComplete => write!(f, "transaction:complete"),
            EventKind::TransactionRollback => write!(f, "transaction:rollback"),
            EventKind::StepStart => write!(f, "step:start"),
            EventKind::StepSuccess => write!(f, "step:success"),
            EventKind::StepRetry => write!(f, "step:retry"),
            EventKind::StepRollback => write!(f, "step:rollback"),
            EventKind::SelectorError => write!(f, "selector:error"),
        }
    }
}

/// Final outcome reported in `transaction:complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Success,
    Fail,
}

impl std::fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionOutcome::Success => write!(f, "success"),
            TransactionOutcome::Fail => write!(f, "fail"),
        }
    }
}

/// Event-specific payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventBody {
    TransactionStart {
        transaction_name: String,
        transaction_id: String,
        payload: serde_json::Value,
    },
    TransactionSuccess {
        transaction_name: String,
        transaction_id: String,
        duration_ms: u64,
    },
    TransactionFail {
        transaction_name: String,
        transaction_id: String,
        error: String,
        duration_ms: u64,
    },
    TransactionComplete {
        transaction_name: String,
        transaction_id: String,
        duration_ms: u64,
        outcome: TransactionOutcome,
    },
    TransactionRollback {
        transaction_name: String,
        transaction_id: String,
        error: String,
    },
    StepStart {
        step_name: String,
        transaction_id: String,
        attempt: u32,
    },
    StepSuccess {
        step_name: String,
        transaction_id: String,
        duration_ms: u64,
    },
    StepRetry {
        step_name: String,
        transaction_id: String,
        attempt: u32,
        error: String,
    },
    StepRollback {
        step_name: String,
        transaction_id: String,
        compensation_error: Option<String>,
    },
    SelectorError {
        selector_name: String,
        error: String,
    },
}

impl EventBody {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::TransactionStart { .. } => EventKind::TransactionStart,
            EventBody::TransactionSuccess { .. } => EventKind::TransactionSuccess,
            EventBody::TransactionFail { .. } => EventKind::TransactionFail,
            EventBody::TransactionComplete { .. } => EventKind::TransactionComplete,
            EventBody::TransactionRollback { .. } => EventKind::TransactionRollback,
            EventBody::StepStart { .. } => EventKind::StepStart,
            EventBody::StepSuccess { .. } => EventKind::StepSuccess,
            EventBody::StepRetry { .. } => EventKind::StepRetry,
            EventBody::StepRollback { .. } => EventKind::StepRollback,
            EventBody::SelectorError { .. } => EventKind::SelectorError,
        }
    }
}

/// A lifecycle event with its emission timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEvent {
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
}

impl SagaEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

type EventListener = Arc<dyn Fn(&SagaEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    by_kind: HashMap<EventKind, Vec<(u64, EventListener)>>,
    any: Vec<(u64, EventListener)>,
    next_id: u64,
}

/// Synchronous event bus with per-kind and catch-all listeners
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for one event kind. Listeners for a kind fire in
    /// registration order, before catch-all listeners.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&SagaEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .by_kind
                .entry(kind)
                .or_default()
                .push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<BusInner>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(listeners) = inner.by_kind.get_mut(&kind) {
                    listeners.retain(|(lid, _)| *lid != id);
                }
            }
        })
    }

    /// Register a listener that receives every emitted event
    pub fn on_any(&self, listener: impl Fn(&SagaEvent) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.any.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<BusInner>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                inner.any.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Emit an event, fanning out synchronously to kind-listeners then
    /// catch-all listeners. Listener panics are contained and logged.
    pub fn emit(&self, body: EventBody) {
        let event = SagaEvent {
            timestamp: Utc::now(),
            body,
        };
        let kind = event.kind();

        // Snapshot the target listeners so emission runs outside the lock
        // and listeners may subscribe/unsubscribe re-entrantly.
        let targets: Vec<EventListener> = {
            let inner = self.lock();
            inner
                .by_kind
                .get(&kind)
                .map(|l| l.iter().map(|(_, f)| f.clone()))
                .into_iter()
                .flatten()
                .chain(inner.any.iter().map(|(_, f)| f.clone()))
                .collect()
        };

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("event listener panicked while handling {}", kind);
            }
        }
    }

    /// Number of registered listeners (kind-specific plus catch-all)
    pub fn listener_count(&self) -> usize {
        let inner = self.lock();
        inner.by_kind.values().map(Vec::len).sum::<usize>() + inner.any.len()
    }

    /// Drop every listener
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.by_kind.clear();
        inner.any.clear();
    }
}
