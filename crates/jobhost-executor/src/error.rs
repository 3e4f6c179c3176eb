//! Error types for the jobhost-executor crate.

use jobhost_core::{JobKey, OwnerId};
use thiserror::Error;

/// All errors that can originate from execution context operations.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// `assign` on a context that already holds a job.
    #[error("Execution context {context} is busy")]
    ContextBusy { context: usize },

    /// Every context in the pool is running something.
    #[error("No execution context available")]
    PoolExhausted,

    /// The job is already being executed by another context.
    #[error("Job {key} is already running")]
    AlreadyRunning { key: JobKey },

    /// A callback came from a principal other than the running job's owner.
    #[error("Caller {caller} does not own the running job (owner {owner})")]
    SecurityViolation { caller: OwnerId, owner: OwnerId },

    /// The connector could not start binding to the executor component.
    #[error("Bind failed: {0}")]
    BindFailed(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecutionError>;
