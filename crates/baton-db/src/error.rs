//! Database error types.

use baton_core::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no jobs ready to run")]
    NoJobs,

    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Core(#[from] baton_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
