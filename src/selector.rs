//! Reactive Selectors
//!
//! Memoized projections over saga state. A selector recomputes on every state
//! commit and fans out to its subscribers only when the projected value
//! changed under its equality. Computed values combine several selectors into
//! a derived value with the same change-only notification contract.
//!
//! Projection panics are contained: the selector keeps its previous memoized
//! value and reports a `selector:error` event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::error::{Result, SagaError};
use crate::event::{EventBody, EventBus};
use crate::state::{SagaState, StateManager};
use crate::subscription::Subscription;

/// Options for creating a selector
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Attach to state commits on first subscribe and detach on last
    /// unsubscribe (default). Eager selectors attach at creation.
    pub lazy: bool,
    /// Name used in `selector:error` events and logs
    pub name: Option<String>,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            lazy: true,
            name: None,
        }
    }
}

type Projection<S, T> = Box<dyn Fn(&S) -> T + Send + Sync>;
type EqualityFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;
type ChangeListener<T> = Arc<dyn Fn(&T, Option<&T>) + Send + Sync>;

struct Subscribers<T> {
    entries: Vec<(u64, ChangeListener<T>)>,
    next_id: u64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

/// Detach hook the manager keeps for teardown on dispose.
pub(crate) trait Detach: Send + Sync {
    fn force_detach(&self);
}

struct SelectorInner<S, T> {
    name: String,
    project: Projection<S, T>,
    equal: EqualityFn<T>,
    memo: Mutex<Option<T>>,
    subscribers: Mutex<Subscribers<T>>,
    attachment: Mutex<Option<Subscription>>,
    lazy: bool,
    state: Arc<StateManager<S>>,
    bus: EventBus,
}

/// Memoized reactive projection over saga state
pub struct Selector<S, T> {
    inner: Arc<SelectorInner<S, T>>,
}

impl<S, T> Clone for Selector<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SagaState, T: Clone + Send + Sync + 'static> Selector<S, T> {
    pub(crate) fn new(
        state: Arc<StateManager<S>>,
        bus: EventBus,
        project: impl Fn(&S) -> T + Send + Sync + 'static,
        equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        options: SelectorOptions,
    ) -> Self {
        let selector = Self {
            inner: Arc::new(SelectorInner {
                name: options.name.unwrap_or_else(|| "selector".to_string()),
                project: Box::new(project),
                equal: Box::new(equal),
                memo: Mutex::new(None),
                subscribers: Mutex::new(Subscribers::default()),
                attachment: Mutex::new(None),
                lazy: options.lazy,
                state,
                bus,
            }),
        };
        if !selector.inner.lazy {
            SelectorInner::attach(&selector.inner);
        }
        selector
    }

    /// Project the current state, memoized under this selector's equality.
    /// Returns the previous memoized value when the fresh projection is equal
    /// to it. Fails only when the projection panics before any value was
    /// memoized.
    pub fn get(&self) -> Result<T> {
        let state = self.inner.state.get_state();
        match self.inner.compute(&state) {
            Some(next) => Ok(self.inner.memoize(next).0),
            None => {
                let memo = self.inner.lock_memo().clone();
                memo.ok_or_else(|| SagaError::Selector {
                    name: self.inner.name.clone(),
                    reason: "projection panicked before a value was memoized".to_string(),
                })
            }
        }
    }

    /// Register a change listener called with `(new, previous)` whenever a
    /// commit produces a value unequal to the memoized one.
    pub fn subscribe(&self, listener: impl Fn(&T, Option<&T>) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut subs = self.inner.lock_subscribers();
            let id = subs.next_id;
            subs.next_id += 1;
            subs.entries.push((id, Arc::new(listener)));
            id
        };

        if self.inner.lazy {
            SelectorInner::attach(&self.inner);
        }

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let now_empty = {
                    let mut subs = inner.lock_subscribers();
                    subs.entries.retain(|(lid, _)| *lid != id);
                    subs.entries.is_empty()
                };
                if now_empty && inner.lazy {
                    inner.detach();
                }
            }
        })
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_subscribers().entries.len()
    }

    pub(crate) fn detach_handle(&self) -> Weak<dyn Detach> {
        let weak: Weak<SelectorInner<S, T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<S: SagaState, T: Clone + Send + Sync + 'static> SelectorInner<S, T> {
    fn lock_memo(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers<T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the projection with panic containment. `None` means it panicked.
    fn compute(&self, state: &S) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(|| (self.project)(state))) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(selector = %self.name, "selector projection panicked");
                self.bus.emit(EventBody::SelectorError {
                    selector_name: self.name.clone(),
                    error: "projection panicked".to_string(),
                });
                None
            }
        }
    }

    /// Store `next` unless it equals the memo. Returns the value to hand out
    /// and the replaced memo when a change occurred.
    fn memoize(&self, next: T) -> (T, Option<ChangedFrom<T>>) {
        let mut memo = self.lock_memo();
        match memo.as_ref() {
            Some(prev) if (self.equal)(prev, &next) => (prev.clone(), None),
            _ => {
                let prev = memo.replace(next.clone());
                (next.clone(), Some(ChangedFrom { next, prev }))
            }
        }
    }

    /// Recompute on a state commit and notify subscribers on change.
    fn on_commit(&self, state: &S) {
        let Some(next) = self.compute(state) else {
            return;
        };
        if let (_, Some(change)) = self.memoize(next) {
            self.fan_out(&change.next, change.prev.as_ref());
        }
    }

    fn fan_out(&self, next: &T, prev: Option<&T>) {
        let targets: Vec<ChangeListener<T>> = self
            .lock_subscribers()
            .entries
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(next, prev))).is_err() {
                warn!(selector = %self.name, "selector subscriber panicked");
            }
        }
    }

    /// Begin observing state commits. Primes the memo so the first commit is
    /// compared against the value as of attachment.
    fn attach(this: &Arc<Self>) {
        let mut attachment = this
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if attachment.is_some() {
            return;
        }
        let current = this.state.get_state();
        if let Some(value) = this.compute(&current) {
            this.memoize(value);
        }
        let weak = Arc::downgrade(this);
        *attachment = Some(this.state.subscribe(move |s| {
            if let Some(inner) = weak.upgrade() {
                inner.on_commit(s);
            }
        }));
    }

    fn detach(&self) {
        let attachment = self
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sub) = attachment {
            sub.dispose();
        }
    }
}

impl<S: SagaState, T: Clone + Send + Sync + 'static> Detach for SelectorInner<S, T> {
    fn force_detach(&self) {
        self.detach();
        self.lock_subscribers().entries.clear();
    }
}

struct ChangedFrom<T> {
    next: T,
    prev: Option<T>,
}

struct ComputedInner<S, U, T> {
    name: String,
    sources: Vec<Selector<S, U>>,
    combine: Box<dyn Fn(&[U]) -> T + Send + Sync>,
    equal: EqualityFn<T>,
    memo: Mutex<Option<T>>,
    subscribers: Mutex<Subscribers<T>>,
    upstream: Mutex<Vec<Subscription>>,
}

/// Derived value combining several selectors over the same state
pub struct Computed<S, U, T> {
    inner: Arc<ComputedInner<S, U, T>>,
}

impl<S, U, T> Clone for Computed<S, U, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, U, T> Computed<S, U, T>
where
    S: SagaState,
    U: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        sources: Vec<Selector<S, U>>,
        combine: impl Fn(&[U]) -> T + Send + Sync + 'static,
        equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        name: String,
    ) -> Self {
        Self {
            inner: Arc::new(ComputedInner {
                name,
                sources,
                combine: Box::new(combine),
                equal: Box::new(equal),
                memo: Mutex::new(None),
                subscribers: Mutex::new(Subscribers::default()),
                upstream: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Combine the current values of every source, memoized under this
    /// computed value's equality.
    pub fn get(&self) -> Result<T> {
        let values = self.inner.source_values()?;
        let next = (self.inner.combine)(&values);
        let mut memo = self
            .inner
            .memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match memo.as_ref() {
            Some(prev) if (self.inner.equal)(prev, &next) => Ok(prev.clone()),
            _ => {
                *memo = Some(next.clone());
                Ok(next)
            }
        }
    }

    /// Register a change listener; the first subscriber attaches this value
    /// to every upstream selector.
    pub fn subscribe(&self, listener: impl Fn(&T, Option<&T>) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut subs = self.inner.lock_subscribers();
            let id = subs.next_id;
            subs.next_id += 1;
            subs.entries.push((id, Arc::new(listener)));
            id
        };

        self.attach_upstream();

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let now_empty = {
                    let mut subs = inner.lock_subscribers();
                    subs.entries.retain(|(lid, _)| *lid != id);
                    subs.entries.is_empty()
                };
                if now_empty {
                    inner.detach_upstream();
                }
            }
        })
    }

    fn attach_upstream(&self) {
        let mut upstream = self
            .inner
            .upstream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !upstream.is_empty() {
            return;
        }
        // Prime the memo so the first upstream change compares against the
        // combined value as of attachment.
        drop(upstream);
        let _ = self.get();
        let mut upstream = self
            .inner
            .upstream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !upstream.is_empty() {
            return;
        }
        for source in &self.inner.sources {
            let weak = Arc::downgrade(&self.inner);
            upstream.push(source.subscribe(move |_, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.recompute();
                }
            }));
        }
    }

    pub(crate) fn detach_handle(&self) -> Weak<dyn Detach> {
        let weak: Weak<ComputedInner<S, U, T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<S, U, T> ComputedInner<S, U, T>
where
    S: SagaState,
    U: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers<T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn source_values(&self) -> Result<Vec<U>> {
        self.sources.iter().map(Selector::get).collect()
    }

    fn recompute(&self) {
        let Ok(values) = self.source_values() else {
            warn!(computed = %self.name, "skipping recompute: source selector failed");
            return;
        };
        let next = (self.combine)(&values);
        let change = {
            let mut memo = self
                .memo
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match memo.as_ref() {
                Some(prev) if (self.equal)(prev, &next) => None,
                _ => {
                    let prev = memo.replace(next.clone());
                    Some(ChangedFrom { next, prev })
                }
            }
        };
        if let Some(change) = change {
            let targets: Vec<ChangeListener<T>> = self
                .lock_subscribers()
                .entries
                .iter()
                .map(|(_, f)| f.clone())
                .collect();
            for listener in targets {
                if catch_unwind(AssertUnwindSafe(|| listener(&change.next, change.prev.as_ref())))
                    .is_err()
                {
                    warn!(computed = %self.name, "computed subscriber panicked");
                }
            }
        }
    }

    fn detach_upstream(&self) {
        let upstream: Vec<Subscription> = self
            .upstream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for sub in upstream {
            sub.dispose();
        }
    }
}

impl<S, U, T> Detach for ComputedInner<S, U, T>
where
    S: SagaState,
    U: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn force_detach(&self) {
        self.detach_upstream();
        self.lock_subscribers().entries.clear();
    }
}
