//! Error types for the Conclave core library.

use thiserror::Error;

/// Result type alias using the Conclave core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Conclave operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller invoked an operation with unusable input (e.g. an empty
    /// prompt). Reported before any job side effects exist.
    #[error("Usage error: {0}")]
    Usage(String),

    /// A job directory or job id that does not exist on disk.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure spawning or driving a worker process.
    #[error("Worker error: {0}")]
    Worker(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
