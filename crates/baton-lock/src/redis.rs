//! Redis-backed lock and load board.
//!
//! Every read-compare-write runs as a Lua script so that it is evaluated
//! atomically against a single key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_core::{
    DistributedLock, Election, Error, LeaderRecord, LoadBoard, LockGuard, NodeId, Result,
    RetryPolicy,
};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::new_token;

const UPDATE_LOAD: &str = include_str!("lua/update_load.lua");
const WITHDRAW: &str = include_str!("lua/withdraw.lua");
const LOCK: &str = include_str!("lua/lock.lua");
const REFRESH: &str = include_str!("lua/refresh.lua");
const UNLOCK: &str = include_str!("lua/unlock.lua");

fn backend(e: redis::RedisError) -> Error {
    Error::Backend(format!("redis: {}", e))
}

/// Connect to Redis, returning a connection manager that reconnects on failure.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).map_err(backend)?;
    ConnectionManager::new(client).await.map_err(backend)
}

/// Leader records stored as Redis hashes `{node, load}` with a TTL.
#[derive(Clone)]
pub struct RedisLoadBoard {
    redis: ConnectionManager,
    update_load: Script,
    withdraw: Script,
}

impl RedisLoadBoard {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            update_load: Script::new(UPDATE_LOAD),
            withdraw: Script::new(WITHDRAW),
        }
    }
}

#[async_trait]
impl LoadBoard for RedisLoadBoard {
    async fn compare_and_update(
        &self,
        key: &str,
        node: &NodeId,
        load: u64,
        ttl: Duration,
    ) -> Result<Election> {
        let mut conn = self.redis.clone();
        let res: i64 = self
            .update_load
            .key(key)
            .arg(node.as_str())
            .arg(load)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(if res == 1 {
            Election::Won
        } else {
            Election::Lost
        })
    }

    async fn withdraw(&self, key: &str, node: &NodeId) -> Result<bool> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .withdraw
            .key(key)
            .arg(node.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn leader(&self, key: &str) -> Result<Option<LeaderRecord>> {
        let mut conn = self.redis.clone();
        let (node, load): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("node")
            .arg("load")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(match (node, load) {
            (Some(node), Some(load)) => Some(LeaderRecord {
                node: node.into(),
                load,
            }),
            _ => None,
        })
    }
}

/// Token-owned locks: `SET key token NX PX ttl`, refreshed and released
/// only by the holder of the token.
#[derive(Clone)]
pub struct RedisLockClient {
    redis: ConnectionManager,
    /// Upper bound on each round trip.
    op_timeout: Duration,
    lock: Script,
}

impl RedisLockClient {
    pub fn new(redis: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            redis,
            op_timeout,
            lock: Script::new(LOCK),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLockClient {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn LockGuard>> {
        let token = new_token();
        let ttl_ms = ttl.as_millis() as u64;
        let mut retries = 0;

        loop {
            let mut conn = self.redis.clone();
            let attempt = tokio::time::timeout(
                self.op_timeout,
                self.lock
                    .key(key)
                    .arg(&token)
                    .arg(ttl_ms)
                    .invoke_async::<_, Option<String>>(&mut conn),
            )
            .await;

            match attempt {
                Ok(Ok(Some(_))) => {
                    return Ok(Arc::new(RedisLockGuard {
                        redis: self.redis.clone(),
                        key: key.to_string(),
                        token,
                        ttl_ms,
                        op_timeout: self.op_timeout,
                        refresh: Script::new(REFRESH),
                        unlock: Script::new(UNLOCK),
                    }));
                }
                Ok(Ok(None)) => debug!(key, "Lock held elsewhere"),
                Ok(Err(e)) => return Err(backend(e)),
                // The SET may still have landed; retrying with the same token is idempotent.
                Err(_) => debug!(key, "Lock attempt timed out"),
            }

            retries += 1;
            match retry.next_delay(retries) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(Error::LockNotAcquired(key.to_string())),
            }
        }
    }
}

pub struct RedisLockGuard {
    redis: ConnectionManager,
    key: String,
    token: String,
    ttl_ms: u64,
    op_timeout: Duration,
    refresh: Script,
    unlock: Script,
}

impl RedisLockGuard {
    async fn run(&self, script: &Script, with_ttl: bool) -> Result<i64> {
        let mut conn = self.redis.clone();
        let mut invocation = script.key(&self.key);
        invocation.arg(&self.token);
        if with_ttl {
            invocation.arg(self.ttl_ms);
        }
        tokio::time::timeout(self.op_timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("lock {}", self.key)))?
            .map_err(backend)
    }
}

#[async_trait]
impl LockGuard for RedisLockGuard {
    fn key(&self) -> &str {
        &self.key
    }

    async fn refresh(&self) -> Result<()> {
        match self.run(&self.refresh, true).await? {
            0 => Err(Error::LockLost(self.key.clone())),
            _ => Ok(()),
        }
    }

    async fn release(&self) -> Result<()> {
        match self.run(&self.unlock, false).await? {
            0 => Err(Error::LockLost(self.key.clone())),
            _ => Ok(()),
        }
    }
}
