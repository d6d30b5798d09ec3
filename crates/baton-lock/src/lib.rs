//! Distributed lock and leader-election backends for Baton.
//!
//! Provides implementations of the coordination traits in `baton-core`:
//! - Redis (production), using Lua scripts for atomic compare-and-update
//! - In-memory (tests and single-process development)

pub mod memory;
pub mod redis;

pub use baton_core::coordination::{
    DistributedLock, Election, LeaderRecord, LoadBoard, LockGuard, RetryPolicy,
};
pub use memory::{MemoryLoadBoard, MemoryLockClient};
pub use self::redis::{RedisLoadBoard, RedisLockClient, connect};
pub use ::redis::aio::ConnectionManager;

use rand::Rng;

/// Random token identifying one lock acquisition.
pub(crate) fn new_token() -> String {
    format!("{:032x}", rand::thread_rng().r#gen::<u128>())
}
