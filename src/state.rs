//! Versioned State Management
//!
//! Holds the live working copy of client state, promotes it to a bounded
//! snapshot history on commit, and notifies commit listeners. Undo/redo move
//! a cursor through the history ring; any new commit truncates the redo tail.
//!
//! Reads hand out deep copies (an owned `Clone`), never references into the
//! working copy. Mutation of the working copy is crate-internal and only
//! reachable through step and middleware contexts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::subscription::Subscription;

/// Marker for values usable as saga state. Blanket-implemented: any owned,
/// clonable, thread-safe value qualifies. `Clone` provides the deep copy the
/// snapshot contract requires.
pub trait SagaState: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> SagaState for T {}

struct StateInner<S> {
    current: S,
    history: VecDeque<S>,
    cursor: usize,
    version: u64,
}

type CommitListener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct ListenerRegistry<S> {
    entries: Vec<(u64, CommitListener<S>)>,
    next_id: u64,
}

impl<S> Default for ListenerRegistry<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

/// Versioned state container with snapshot history and undo/redo
pub struct StateManager<S> {
    inner: Mutex<StateInner<S>>,
    listeners: Arc<Mutex<ListenerRegistry<S>>>,
    max_history: usize,
}

impl<S: SagaState> StateManager<S> {
    /// Create a manager seeded with `initial`. The initial state counts as
    /// the first history entry.
    pub fn new(initial: S, max_history: usize) -> Self {
        let mut history = VecDeque::new();
        history.push_back(initial.clone());
        Self {
            inner: Mutex::new(StateInner {
                current: initial,
                history,
                cursor: 0,
                version: 0,
            }),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            max_history: max_history.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner<S>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deep-cloned view of the current working copy
    pub fn get_state(&self) -> S {
        self.lock().current.clone()
    }

    /// Deep copy of the current working copy without committing. Used to
    /// capture pre-step state for rollback.
    pub fn snapshot(&self) -> S {
        self.lock().current.clone()
    }

    /// Replace the working copy with `snap`. Does not commit and does not
    /// notify listeners.
    pub(crate) fn restore(&self, snap: S) {
        self.lock().current = snap;
    }

    /// Mutate the working copy in place. Does not commit.
    pub(crate) fn update(&self, f: impl FnOnce(&mut S)) {
        f(&mut self.lock().current);
    }

    /// Promote the working copy to history: truncates any redo tail, appends
    /// a snapshot, bounds the ring, bumps the committed version, and notifies
    /// commit listeners in registration order.
    pub(crate) fn commit(&self) {
        let committed = {
            let mut inner = self.lock();
            let cursor = inner.cursor;
            inner.history.truncate(cursor + 1);
            let snap = inner.current.clone();
            inner.history.push_back(snap.clone());
            inner.cursor += 1;
            while inner.history.len() > self.max_history {
                inner.history.pop_front();
                inner.cursor -= 1;
            }
            inner.version += 1;
            debug!(version = inner.version, "state committed");
            snap
        };
        self.notify(&committed);
    }

    /// Step the cursor back one snapshot. Returns whether anything changed.
    pub fn undo(&self) -> bool {
        let restored = {
            let mut inner = self.lock();
            if inner.cursor == 0 {
                return false;
            }
            inner.cursor -= 1;
            let snap = inner.history[inner.cursor].clone();
            inner.current = snap.clone();
            debug!(cursor = inner.cursor, "state undo");
            snap
        };
        self.notify(&restored);
        true
    }

    /// Step the cursor forward one snapshot. Returns whether anything changed.
    pub fn redo(&self) -> bool {
        let restored = {
            let mut inner = self.lock();
            if inner.cursor + 1 >= inner.history.len() {
                return false;
            }
            inner.cursor += 1;
            let snap = inner.history[inner.cursor].clone();
            inner.current = snap.clone();
            debug!(cursor = inner.cursor, "state redo");
            snap
        };
        self.notify(&restored);
        true
    }

    /// Monotonically increasing commit counter
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Number of snapshots currently held
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Register a commit listener. Listeners also fire on undo/redo, with the
    /// restored snapshot.
    pub fn subscribe(&self, listener: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<ListenerRegistry<S>>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .entries
                    .retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Clear history and listeners, reset the version counter
    pub(crate) fn dispose(&self) {
        {
            let mut inner = self.lock();
            inner.history.clear();
            inner.cursor = 0;
            inner.version = 0;
        }
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .clear();
    }

    fn notify(&self, state: &S) {
        // Snapshot the registry so listeners can subscribe/unsubscribe
        // re-entrantly without deadlocking.
        let targets: Vec<CommitListener<S>> = {
            let registry = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.entries.iter().map(|(_, f)| f.clone()).collect()
        };
        for listener in targets {
            listener(state);
        }
    }
}
