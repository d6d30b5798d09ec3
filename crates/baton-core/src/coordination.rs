//! Coordination primitives backed by a shared key-value store.
//!
//! Two separate pieces make up singleton leadership:
//! - a [`LoadBoard`], which atomically compares a candidate's load against
//!   the recorded leader and records the better of the two;
//! - a [`DistributedLock`], the actual mutual-exclusion lease held by
//!   whoever wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{Error, NodeId, Result};

/// Outcome of one load comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Election {
    /// The record now names the candidate.
    Won,
    /// The recorded leader is still the better candidate; nothing changed.
    Lost,
}

/// The comparison record for one leadership key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecord {
    pub node: NodeId,
    pub load: u64,
}

impl LeaderRecord {
    /// Total order used by every node: lower load wins, node id breaks ties.
    pub fn is_beaten_by(&self, node: &NodeId, load: u64) -> bool {
        (load, node) < (self.load, &self.node)
    }
}

#[async_trait]
pub trait LoadBoard: Send + Sync {
    /// Atomically record `node` as leader under `key` if there is no record,
    /// the record already names `node`, or `node` beats it. A winning write
    /// sets the record's TTL to `ttl`.
    async fn compare_and_update(
        &self,
        key: &str,
        node: &NodeId,
        load: u64,
        ttl: Duration,
    ) -> Result<Election>;

    /// Delete the record if it still names `node`. Returns whether it did.
    async fn withdraw(&self, key: &str, node: &NodeId) -> Result<bool>;

    /// Current record, if any.
    async fn leader(&self, key: &str) -> Result<Option<LeaderRecord>>;
}

/// Fixed-interval retry policy for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once exhausted.
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        (retry <= self.max_retries).then_some(self.interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(100), 3)
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key` for `ttl`, retrying per `retry` while it is held elsewhere.
    /// Fails with [`Error::LockNotAcquired`] once retries are exhausted.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn LockGuard>>;
}

/// A held lock.
#[async_trait]
pub trait LockGuard: Send + Sync {
    fn key(&self) -> &str;

    /// Extend the lease by its TTL. Fails with [`Error::LockLost`] if the
    /// lease expired or is now held by someone else.
    async fn refresh(&self) -> Result<()>;

    /// Give the lock up. Fails with [`Error::LockLost`] if it was not held.
    async fn release(&self) -> Result<()>;
}

/// Refresh `guard` every `interval` until `cancel` fires (returns `Ok`) or a
/// refresh fails or exceeds `timeout` (returns the error).
pub async fn auto_refresh(
    guard: &dyn LockGuard,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                tokio::time::timeout(timeout, guard.refresh())
                    .await
                    .map_err(|_| Error::Timeout(format!("refreshing lock {}", guard.key())))??;
            }
        }
    }
}
