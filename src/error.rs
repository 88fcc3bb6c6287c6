use thiserror::Error;

/// Boxed error source produced by step and compensation bodies.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the saga orchestrator
#[derive(Error, Debug)]
pub enum SagaError {
    // Step execution errors
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("transaction '{transaction}' was cancelled")]
    Cancelled { transaction: String },

    // Manager lifecycle errors
    #[error("a transaction is already in progress")]
    Busy,

    #[error("saga manager has been disposed")]
    Disposed,

    // Middleware errors
    #[error("middleware aborted transaction: {reason}")]
    MiddlewareAbort { reason: String },

    // Rollback errors (reported, never propagated past the rollback loop)
    #[error("compensation for step '{step}' failed: {source}")]
    Compensation {
        step: String,
        #[source]
        source: StepError,
    },

    // State errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    // Collaborator boundary errors
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("selector '{name}' failed: {reason}")]
    Selector { name: String, reason: String },

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Whether this error is a cancellation, which skips retry attempts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SagaError::Cancelled { .. })
    }
}

/// Result type alias for saga operations
pub type Result<T> = std::result::Result<T, SagaError>;
