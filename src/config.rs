use serde::{Deserialize, Serialize};

/// Configuration for a saga manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Maximum snapshots kept in the undo/redo history (default: 50)
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    /// Capture a pre-step snapshot before every step so retries and rollback
    /// can restore it (default: true). When disabled, rollback relies on
    /// compensations plus the pre-transaction snapshot.
    #[serde(default = "default_auto_snapshot")]
    pub auto_snapshot: bool,
    /// Log every emitted event at debug level (default: false)
    #[serde(default)]
    pub enable_dev_tools: bool,
    /// Queue concurrent transactions FIFO behind the in-flight one.
    /// When false, `run` fails fast with `SagaError::Busy` (default: true)
    #[serde(default = "default_queue_transactions")]
    pub queue_transactions: bool,
    /// Delay between retry attempts in milliseconds (default: 0, immediate)
    #[serde(default)]
    pub retry_delay_ms: u64,
}

fn default_max_history_size() -> usize {
    50
}

fn default_auto_snapshot() -> bool {
    true
}

fn default_queue_transactions() -> bool {
    true
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_history_size: default_max_history_size(),
            auto_snapshot: default_auto_snapshot(),
            enable_dev_tools: false,
            queue_transactions: default_queue_transactions(),
            retry_delay_ms: 0,
        }
    }
}
