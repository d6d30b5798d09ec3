//! Core domain types and traits for Baton.
//!
//! This crate contains:
//! - Job and node identifiers
//! - The persisted job model and cron schedule evaluation
//! - Executor trait and registry
//! - The locally ticked job trait
//! - Distributed lock and load-comparison abstractions

pub mod coordination;
pub mod cron_job;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;

pub use coordination::{
    DistributedLock, Election, LeaderRecord, LoadBoard, LockGuard, RetryPolicy, auto_refresh,
};
pub use cron_job::CronJob;
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorRegistry, LocalExecutor};
pub use id::{JobId, NodeId};
pub use job::{Job, JobDefinition, JobStatus};
