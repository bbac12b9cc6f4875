//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The container command exited non-zero.
    #[error("{binary} {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        binary: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The container command could not be spawned at all.
    #[error("failed to run {binary} {command}: {source}")]
    Spawn {
        binary: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
