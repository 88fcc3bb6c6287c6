//! Subscription Handles
//!
//! Every subscribe operation in the crate (event bus, state commits,
//! selectors) returns a [`Subscription`] that detaches the listener when
//! disposed. Disposal is idempotent.

use std::sync::Mutex;

type DisposeFn = Box<dyn FnOnce() + Send>;

/// Handle over a registered listener
pub struct Subscription {
    dispose_fn: Mutex<Option<DisposeFn>>,
}

impl Subscription {
    /// Create a subscription that runs `dispose_fn` once when disposed
    pub(crate) fn new(dispose_fn: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose_fn: Mutex::new(Some(Box::new(dispose_fn))),
        }
    }

    /// Create an already-disposed subscription
    pub(crate) fn empty() -> Self {
        Self {
            dispose_fn: Mutex::new(None),
        }
    }

    /// Detach the listener. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        let dispose_fn = self
            .dispose_fn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(f) = dispose_fn {
            f();
        }
    }

    /// Whether the listener has already been detached
    pub fn is_disposed(&self) -> bool {
        self.dispose_fn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
