//! Job scheduling for Baton.
//!
//! Two ways to run work across a fleet of workers:
//! - [`Scheduler`] preempts due jobs from a shared job store with versioned
//!   claims and runs them on registered executors.
//! - [`SingletonLeaderJob`] runs a locally ticked job on exactly one node,
//!   chosen by load and guarded by a distributed lock.

pub mod cron;
pub mod leader;
pub mod lease;
pub mod load;
pub mod metrics;
pub mod scheduler;

pub use cron::{CronJobAdapter, Ticker};
pub use leader::SingletonLeaderJob;
pub use lease::RunningJob;
pub use load::{FixedLoad, LoadProbe, RandomLoad};
pub use metrics::JobMetrics;
pub use scheduler::Scheduler;
