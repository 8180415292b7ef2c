//! Error types for Hangar.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A task was rejected by `Queue::schedule` before entering the queue.
    #[error("admission rejected: {0}")]
    Admission(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A value that could not be parsed, such as an unknown enum name.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid label expression: {0}")]
    InvalidLabel(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("executor lost: {0}")]
    ExecutorLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
