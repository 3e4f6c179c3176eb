use jobhost_core::JobKey;
use thiserror::Error;

/// Errors that can occur within the job store subsystem.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The submitted job description is inconsistent or unsupported.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given identity exists in the store.
    #[error("Job not found: {key}")]
    JobNotFound { key: JobKey },

    /// Snapshot document could not be encoded or decoded.
    #[error("Snapshot format error: {0}")]
    Format(#[from] serde_json::Error),

    /// The snapshot was written by an incompatible version.
    #[error("Snapshot version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u64, expected: u32 },

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Atomic rename of the temporary snapshot failed.
    #[error("Snapshot replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
