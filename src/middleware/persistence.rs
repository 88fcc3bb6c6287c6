//! Persistence Middleware
//!
//! Mirrors the post-transaction state into a pluggable string-addressable
//! snapshot store. Persistence is best-effort: a failing store is logged and
//! never fails or rolls back the transaction that produced the state.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::{Result, SagaError};
use crate::state::SagaState;

/// String-addressable store for serialized state snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist `snapshot` under `key`, replacing any previous value
    async fn save(&self, key: &str, snapshot: serde_json::Value) -> Result<()>;

    /// Load the snapshot stored under `key`
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, key: &str, snapshot: serde_json::Value) -> Result<()> {
        self.entries.insert(key.to_string(), snapshot);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

/// Load a previously persisted state value, e.g. to seed a new manager.
/// Fails with [`SagaError::Persistence`] when the stored snapshot is not
/// structurally compatible with `T`.
pub async fn load_persisted_state<T: DeserializeOwned>(
    store: &dyn SnapshotStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SagaError::Persistence(format!("snapshot under '{key}' is invalid: {e}"))),
        None => Ok(None),
    }
}

/// Middleware that saves the state to a [`SnapshotStore`] after every
/// successful transaction
pub struct PersistenceMiddleware {
    store: Arc<dyn SnapshotStore>,
    key: String,
}

impl PersistenceMiddleware {
    pub fn new(store: Arc<dyn SnapshotStore>, key: &str) -> Self {
        Self {
            store,
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl<S: SagaState + Serialize> Middleware<S> for PersistenceMiddleware {
    async fn handle(&self, ctx: MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        next.run(ctx.clone()).await?;

        match serde_json::to_value(ctx.state()) {
            Ok(snapshot) => {
                if let Err(e) = self.store.save(&self.key, snapshot).await {
                    warn!(key = %self.key, error = %e, "failed to persist state snapshot");
                } else {
                    debug!(key = %self.key, "state snapshot persisted");
                }
            }
            Err(e) => warn!(key = %self.key, error = %e, "state is not serializable"),
        }

        Ok(())
    }
}
