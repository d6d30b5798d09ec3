//! KDL configuration parsing for Baton.
//!
//! This crate handles parsing of:
//! - Worker configuration (baton.kdl): store connections, scheduler tuning
//! - Singleton (leader-elected) job settings
//! - Operator-provided job definitions

pub mod duration;
pub mod error;
pub mod worker;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use worker::{
    SchedulerConfig, SingletonConfig, WorkerConfig, load_worker_config, parse_worker_config,
};
