//! Error types for Baton.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid schedule expression {expression:?}: {message}")]
    Schedule { expression: String, message: String },

    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),

    #[error("lock lost: {0}")]
    LockLost(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the caller no longer holds a lock it believed it held.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Error::LockLost(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
