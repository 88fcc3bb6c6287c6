//! Cooperative Cancellation
//!
//! One-shot cancel token observed by the transaction executor at step
//! boundaries and retry decisions, and by step bodies that opt in. The
//! currently-executing step is never forcibly killed; it must observe the
//! token or complete naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

struct CancelInner {
    cancelled: AtomicBool,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

/// One-shot cooperative cancellation token
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                tx,
                rx,
            }),
        }
    }

    /// Request cancellation. Idempotent; duplicate calls are ignored.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cancellation requested");
        let _ = self.inner.tx.send(true);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.inner.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
