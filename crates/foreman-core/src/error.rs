//! Engine error taxonomy.
//!
//! Validation errors surface synchronously to the caller; execution
//! errors are recorded on the task and propagated from `execute_task`;
//! persistence errors are absorbed at component boundaries (logged,
//! never fatal) except where the operation's whole contract is the
//! write (DLQ inserts).

use thiserror::Error;
use uuid::Uuid;

use foreman_store::StoreError;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A caller-supplied value violated an input contract (name length,
    /// dependency count, missing dependency id, retry limit).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("executor {0:?} is not registered")]
    ExecutorNotFound(String),

    /// Execution exceeded its time budget. Routed internally to
    /// retry/DLQ/fail; callers see it as the task's `error` field and
    /// as the propagated error from `execute_task`.
    #[error("task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: Uuid, timeout_ms: u64 },

    /// The executor returned or raised a failure.
    #[error("executor failed: {0}")]
    ExecutorFailure(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
