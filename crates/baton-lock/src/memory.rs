//! In-process lock and load board.
//!
//! Clones share state, so several simulated nodes in one process can
//! compete through the same instance. Expiry follows the tokio clock, which
//! lets tests drive TTLs with a paused runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::{
    DistributedLock, Election, Error, LeaderRecord, LoadBoard, LockGuard, NodeId, Result,
    RetryPolicy,
};
use tokio::time::Instant;

use crate::new_token;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Clone, Default)]
pub struct MemoryLoadBoard {
    records: Arc<Mutex<HashMap<String, Expiring<LeaderRecord>>>>,
}

impl MemoryLoadBoard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadBoard for MemoryLoadBoard {
    async fn compare_and_update(
        &self,
        key: &str,
        node: &NodeId,
        load: u64,
        ttl: Duration,
    ) -> Result<Election> {
        let now = Instant::now();
        let mut records = lock(&self.records);

        if let Some(current) = records.get(key).filter(|r| r.live(now)) {
            if current.value.node != *node && !current.value.is_beaten_by(node, load) {
                return Ok(Election::Lost);
            }
        }

        records.insert(
            key.to_string(),
            Expiring {
                value: LeaderRecord {
                    node: node.clone(),
                    load,
                },
                expires_at: now + ttl,
            },
        );
        Ok(Election::Won)
    }

    async fn withdraw(&self, key: &str, node: &NodeId) -> Result<bool> {
        let mut records = lock(&self.records);
        let owned = records
            .get(key)
            .is_some_and(|r| r.live(Instant::now()) && r.value.node == *node);
        if owned {
            records.remove(key);
        }
        Ok(owned)
    }

    async fn leader(&self, key: &str) -> Result<Option<LeaderRecord>> {
        let now = Instant::now();
        Ok(lock(&self.records)
            .get(key)
            .filter(|r| r.live(now))
            .map(|r| r.value.clone()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryLockClient {
    locks: Arc<Mutex<HashMap<String, Expiring<String>>>>,
}

impl MemoryLockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut locks = lock(&self.locks);
        if locks.get(key).is_some_and(|l| l.live(now)) {
            return false;
        }
        locks.insert(
            key.to_string(),
            Expiring {
                value: token.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Whether anyone currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.locks)
            .get(key)
            .is_some_and(|l| l.live(Instant::now()))
    }

    /// Forcibly drop `key`, as if its lease had expired on the server.
    pub fn revoke(&self, key: &str) {
        lock(&self.locks).remove(key);
    }
}

#[async_trait]
impl DistributedLock for MemoryLockClient {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn LockGuard>> {
        let token = new_token();
        let mut retries = 0;
        loop {
            if self.try_acquire(key, &token, ttl) {
                return Ok(Arc::new(MemoryLockGuard {
                    locks: self.locks.clone(),
                    key: key.to_string(),
                    token,
                    ttl,
                }));
            }
            retries += 1;
            match retry.next_delay(retries) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(Error::LockNotAcquired(key.to_string())),
            }
        }
    }
}

pub struct MemoryLockGuard {
    locks: Arc<Mutex<HashMap<String, Expiring<String>>>>,
    key: String,
    token: String,
    ttl: Duration,
}

impl MemoryLockGuard {
    fn owned(&self, locks: &HashMap<String, Expiring<String>>) -> bool {
        locks
            .get(&self.key)
            .is_some_and(|l| l.live(Instant::now()) && l.value == self.token)
    }
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    fn key(&self) -> &str {
        &self.key
    }

    async fn refresh(&self) -> Result<()> {
        let mut locks = lock(&self.locks);
        if !self.owned(&locks) {
            return Err(Error::LockLost(self.key.clone()));
        }
        if let Some(l) = locks.get_mut(&self.key) {
            l.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut locks = lock(&self.locks);
        if !self.owned(&locks) {
            return Err(Error::LockLost(self.key.clone()));
        }
        locks.remove(&self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_board_scenario_lowest_load_wins() {
        let board = MemoryLoadBoard::new();
        let key = "job:ranking";
        let loads = [("node1", 50), ("node2", 10), ("node3", 30)];

        let mut outcomes = Vec::new();
        for (node, load) in loads {
            outcomes.push(
                board
                    .compare_and_update(key, &NodeId::from(node), load, TTL)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(outcomes, vec![Election::Won, Election::Won, Election::Lost]);
        let leader = board.leader(key).await.unwrap().unwrap();
        assert_eq!(leader.node, NodeId::from("node2"));
        assert_eq!(leader.load, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_incumbent_updates_own_load() {
        let board = MemoryLoadBoard::new();
        let key = "job:ranking";
        let node1 = NodeId::from("node1");
        let node2 = NodeId::from("node2");

        board.compare_and_update(key, &node1, 10, TTL).await.unwrap();
        assert_eq!(
            board.compare_and_update(key, &node1, 90, TTL).await.unwrap(),
            Election::Won
        );
        assert_eq!(
            board.compare_and_update(key, &node2, 40, TTL).await.unwrap(),
            Election::Won
        );
        assert_eq!(
            board.compare_and_update(key, &node1, 50, TTL).await.unwrap(),
            Election::Lost
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_record_expires() {
        let board = MemoryLoadBoard::new();
        let key = "job:ranking";
        board
            .compare_and_update(key, &NodeId::from("node2"), 10, TTL)
            .await
            .unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(board.leader(key).await.unwrap().is_none());
        assert_eq!(
            board
                .compare_and_update(key, &NodeId::from("node1"), 50, TTL)
                .await
                .unwrap(),
            Election::Won
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_only_own_record() {
        let board = MemoryLoadBoard::new();
        let key = "job:ranking";
        let node1 = NodeId::from("node1");
        board.compare_and_update(key, &node1, 10, TTL).await.unwrap();

        assert!(!board.withdraw(key, &NodeId::from("node2")).await.unwrap());
        assert!(board.withdraw(key, &node1).await.unwrap());
        assert!(board.leader(key).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_exclusive_with_bounded_retry() {
        let client = MemoryLockClient::new();
        let retry = RetryPolicy::default();
        let guard = client.acquire("job:ranking:lock", TTL, &retry).await.unwrap();

        let started = Instant::now();
        let second = client.acquire("job:ranking:lock", TTL, &retry).await;
        assert!(matches!(second, Err(Error::LockNotAcquired(_))));
        assert!(started.elapsed() >= Duration::from_millis(300));

        guard.release().await.unwrap();
        assert!(!client.is_held("job:ranking:lock"));
        client
            .acquire("job:ranking:lock", TTL, &retry)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_refresh_after_expiry_fails() {
        let client = MemoryLockClient::new();
        let guard = client
            .acquire("k", TTL, &RetryPolicy::default())
            .await
            .unwrap();

        tokio::time::advance(TTL / 2).await;
        guard.refresh().await.unwrap();
        tokio::time::advance(TTL / 2).await;
        assert!(client.is_held("k"), "refresh extended the lease");

        tokio::time::advance(TTL).await;
        assert!(matches!(guard.refresh().await, Err(Error::LockLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lock_cannot_be_released() {
        let client = MemoryLockClient::new();
        let guard = client
            .acquire("k", TTL, &RetryPolicy::default())
            .await
            .unwrap();
        client.revoke("k");

        assert!(matches!(guard.release().await, Err(Error::LockLost(_))));
        let other = client
            .acquire("k", TTL, &RetryPolicy::default())
            .await
            .unwrap();
        assert!(guard.release().await.is_err(), "stale guard must not free a new holder");
        other.release().await.unwrap();
    }
}
