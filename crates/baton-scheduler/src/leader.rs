//! Singleton jobs guarded by load-based leader election.
//!
//! Every node ticks the same [`SingletonLeaderJob`] locally. On each tick a
//! node compares its load against the recorded leader on a shared
//! [`LoadBoard`]; the lowest load wins the record and then has to take the
//! [`DistributedLock`] before it may run the body. A leader that is beaten
//! steps down and releases the lock, and one whose lock refresh fails
//! withdraws its record so the next best node can take over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use baton_config::SingletonConfig;
use baton_core::{
    CronJob, DistributedLock, Election, Error, LoadBoard, LockGuard, NodeId, Result,
    auto_refresh,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::load::LoadProbe;

struct Held {
    guard: Arc<dyn LockGuard>,
    generation: u64,
    /// Stops the refresh task and any body still running under this lease.
    stop: CancellationToken,
}

#[derive(Default)]
struct Leadership {
    held: Option<Held>,
    generation: u64,
}

pub struct SingletonLeaderJob {
    node: NodeId,
    config: SingletonConfig,
    board: Arc<dyn LoadBoard>,
    lock: Arc<dyn DistributedLock>,
    probe: Arc<dyn LoadProbe>,
    body: Arc<dyn CronJob>,
    load: Arc<AtomicU64>,
    state: Arc<Mutex<Leadership>>,
    shutdown: CancellationToken,
}

impl SingletonLeaderJob {
    pub fn new(
        node: NodeId,
        config: SingletonConfig,
        board: Arc<dyn LoadBoard>,
        lock: Arc<dyn DistributedLock>,
        probe: Arc<dyn LoadProbe>,
        body: Arc<dyn CronJob>,
    ) -> Self {
        let load = Arc::new(AtomicU64::new(probe.sample()));
        Self {
            node,
            config,
            board,
            lock,
            probe,
            body,
            load,
            state: Arc::new(Mutex::new(Leadership::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The load this node will report on its next tick.
    pub fn current_load(&self) -> u64 {
        self.load.load(Ordering::SeqCst)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.held.is_some()
    }

    /// Re-sample the load probe every `load_refresh` until shutdown.
    pub fn start_load_refresh(&self) -> JoinHandle<()> {
        let probe = self.probe.clone();
        let load = self.load.clone();
        let period = self.config.load_refresh;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => load.store(probe.sample(), Ordering::SeqCst),
                }
            }
        })
    }

    /// Give up leadership for good: stop refreshing, release the lock and
    /// withdraw this node's record. Later ticks do nothing.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let held = self.state.lock().await.held.take();
        if let Some(held) = held {
            held.stop.cancel();
            self.release(held.guard.as_ref()).await;
            info!(job = %self.config.name, node = %self.node, "Released leadership on shutdown");
        }
        self.withdraw().await;
    }

    async fn release(&self, guard: &dyn LockGuard) {
        match tokio::time::timeout(self.config.lock_timeout, guard.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = guard.key(), error = %e, "Failed to release leader lock"),
            Err(_) => warn!(key = guard.key(), "Timed out releasing leader lock"),
        }
    }

    async fn withdraw(&self) {
        if let Err(e) = self.board.withdraw(&self.config.key, &self.node).await {
            warn!(key = %self.config.key, error = %e, "Failed to withdraw leader record");
        }
    }

    /// Take leadership with a freshly acquired lock and keep it refreshed.
    fn hold(&self, state: &mut Leadership, guard: Arc<dyn LockGuard>) {
        state.generation += 1;
        let generation = state.generation;
        let stop = self.shutdown.child_token();

        let refresh = {
            let guard = guard.clone();
            let stop = stop.clone();
            let state = self.state.clone();
            let board = self.board.clone();
            let node = self.node.clone();
            let key = self.config.key.clone();
            let interval = self.config.ttl / 2;
            let timeout = self.config.lock_timeout;

            async move {
                let Err(e) = auto_refresh(guard.as_ref(), interval, timeout, &stop).await else {
                    return;
                };
                warn!(key = guard.key(), node = %node, error = %e, "Leader lock refresh failed");

                let mut state = state.lock().await;
                // A newer lease may already have replaced this one.
                if state.held.as_ref().is_some_and(|h| h.generation == generation) {
                    if let Some(held) = state.held.take() {
                        held.stop.cancel();
                    }
                    drop(state);
                    if let Err(e) = board.withdraw(&key, &node).await {
                        warn!(key = %key, error = %e, "Failed to withdraw leader record");
                    }
                }
            }
        };
        tokio::spawn(refresh);

        state.held = Some(Held {
            guard,
            generation,
            stop,
        });
    }

    /// One election round. Returns the lease to run under if this node leads
    /// at the end of it.
    async fn elect(&self) -> Result<Option<CancellationToken>> {
        let load = self.current_load();
        let key = &self.config.key;
        let mut state = self.state.lock().await;

        if let Some(held) = &state.held {
            match self
                .board
                .compare_and_update(key, &self.node, load, self.config.ttl)
                .await
            {
                Ok(Election::Won) => return Ok(Some(held.stop.clone())),
                Ok(Election::Lost) => {
                    let Some(held) = state.held.take() else {
                        return Ok(None);
                    };
                    held.stop.cancel();
                    drop(state);
                    self.release(held.guard.as_ref()).await;
                    info!(job = %self.config.name, node = %self.node, load, "Stepped down for a less loaded node");
                    return Ok(None);
                }
                // The lock is still ours until its refresh says otherwise.
                Err(e) => {
                    warn!(key = %key, error = %e, "Load comparison failed, keeping leadership");
                    return Ok(Some(held.stop.clone()));
                }
            }
        }

        let election = self
            .board
            .compare_and_update(key, &self.node, load, self.config.ttl)
            .await?;
        if election == Election::Lost {
            debug!(job = %self.config.name, node = %self.node, load, "Not the least loaded node");
            return Ok(None);
        }

        let lock_key = self.config.lock_key();
        let retry = self.config.retry_policy();
        match self.lock.acquire(&lock_key, self.config.ttl, &retry).await {
            Ok(guard) => {
                self.hold(&mut state, guard);
                info!(job = %self.config.name, node = %self.node, load, "Became leader");
                Ok(state.held.as_ref().map(|h| h.stop.clone()))
            }
            Err(Error::LockNotAcquired(_)) => {
                debug!(key = %lock_key, node = %self.node, "Lock still held by the previous leader");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CronJob for SingletonLeaderJob {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let Some(lease) = self.elect().await? else {
            return Ok(());
        };

        tokio::select! {
            result = tokio::time::timeout(self.config.run_timeout, self.body.run()) => {
                result.map_err(|_| Error::Timeout(format!("singleton job {}", self.config.name)))?
            }
            _ = lease.cancelled() => Err(Error::LockLost(self.config.lock_key())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::FixedLoad;
    use baton_lock::{MemoryLoadBoard, MemoryLockClient};
    use baton_core::LeaderRecord;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(10);

    /// Records which node ran the body.
    struct Recorder {
        node: String,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl CronJob for Recorder {
        fn name(&self) -> &str {
            "ranking"
        }

        async fn run(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.node.clone());
            Ok(())
        }
    }

    struct Cluster {
        board: MemoryLoadBoard,
        locks: MemoryLockClient,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Cluster {
        fn new() -> Self {
            Self {
                board: MemoryLoadBoard::new(),
                locks: MemoryLockClient::new(),
                log: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn node(&self, name: &str, load: u64) -> SingletonLeaderJob {
            let mut config = SingletonConfig::new("ranking");
            config.ttl = TTL;
            SingletonLeaderJob::new(
                NodeId::from(name),
                config,
                Arc::new(self.board.clone()),
                Arc::new(self.locks.clone()),
                Arc::new(FixedLoad::new(load)),
                Arc::new(Recorder {
                    node: name.to_string(),
                    log: self.log.clone(),
                }),
            )
        }

        /// Tick every node once; returns who ran the body this round.
        async fn round(&self, nodes: &[&SingletonLeaderJob]) -> Vec<String> {
            for node in nodes {
                node.run().await.unwrap();
            }
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    async fn leaders(nodes: &[&SingletonLeaderJob]) -> Vec<String> {
        let mut leaders = Vec::new();
        for node in nodes {
            if node.is_leader().await {
                leaders.push(node.node().to_string());
            }
        }
        leaders
    }

    /// A board that can be switched to fail every call.
    #[derive(Clone, Default)]
    struct FlakyBoard {
        inner: MemoryLoadBoard,
        failing: Arc<AtomicBool>,
    }

    impl FlakyBoard {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Backend("board unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LoadBoard for FlakyBoard {
        async fn compare_and_update(
            &self,
            key: &str,
            node: &NodeId,
            load: u64,
            ttl: Duration,
        ) -> Result<Election> {
            self.check()?;
            self.inner.compare_and_update(key, node, load, ttl).await
        }

        async fn withdraw(&self, key: &str, node: &NodeId) -> Result<bool> {
            self.check()?;
            self.inner.withdraw(key, node).await
        }

        async fn leader(&self, key: &str) -> Result<Option<LeaderRecord>> {
            self.check()?;
            self.inner.leader(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowest_load_takes_over_and_recovers_from_lock_loss() {
        let cluster = Cluster::new();
        let node1 = cluster.node("node1", 50);
        let node2 = cluster.node("node2", 10);
        let node3 = cluster.node("node3", 30);
        let all = [&node1, &node2, &node3];

        // node1 ticks first against an empty board and takes the lease. node2
        // beats its record in the same round but the lock is still held, so
        // the handover lands one round later when node1 steps down.
        assert_eq!(cluster.round(&all).await, vec!["node1"]);
        assert_eq!(cluster.round(&all).await, vec!["node2"]);
        assert_eq!(cluster.round(&all).await, vec!["node2"]);
        assert_eq!(leaders(&all).await, vec!["node2"]);

        // node2's lease is lost and it stops participating.
        cluster.locks.revoke("job:ranking:lock");
        tokio::time::sleep(TTL / 2 + Duration::from_secs(1)).await;
        assert!(!node2.is_leader().await);
        assert!(cluster.board.leader("job:ranking").await.unwrap().is_none());

        let survivors = [&node1, &node3];
        assert_eq!(cluster.round(&survivors).await, vec!["node1"]);
        assert_eq!(cluster.round(&survivors).await, vec!["node3"]);
        assert_eq!(cluster.round(&survivors).await, vec!["node3"]);
        assert_eq!(leaders(&survivors).await, vec!["node3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_waits_for_previous_leader_to_release() {
        let cluster = Cluster::new();
        let busy = cluster.node("node1", 50);
        let idle = cluster.node("node2", 10);

        assert_eq!(cluster.round(&[&busy]).await, vec!["node1"]);

        // node2 wins the comparison but the lock is still held.
        assert!(cluster.round(&[&idle]).await.is_empty());
        assert!(!idle.is_leader().await);

        // node1 sees it was beaten and steps down.
        assert!(cluster.round(&[&busy]).await.is_empty());
        assert!(!cluster.locks.is_held("job:ranking:lock"));

        assert_eq!(cluster.round(&[&idle]).await, vec!["node2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_errors_keep_leader_and_fail_followers() {
        let board = FlakyBoard::default();
        let locks = MemoryLockClient::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let node = |name: &str, load: u64| {
            let mut config = SingletonConfig::new("ranking");
            config.ttl = TTL;
            SingletonLeaderJob::new(
                NodeId::from(name),
                config,
                Arc::new(board.clone()),
                Arc::new(locks.clone()),
                Arc::new(FixedLoad::new(load)),
                Arc::new(Recorder {
                    node: name.to_string(),
                    log: log.clone(),
                }),
            )
        };
        let leader = node("node1", 50);
        let follower = node("node2", 10);

        leader.run().await.unwrap();
        assert!(leader.is_leader().await);

        board.failing.store(true, Ordering::SeqCst);
        leader.run().await.unwrap();
        assert!(leader.is_leader().await);
        assert!(locks.is_held("job:ranking:lock"));

        assert!(matches!(follower.run().await, Err(Error::Backend(_))));
        assert!(!follower.is_leader().await);

        assert_eq!(*log.lock().unwrap(), vec!["node1", "node1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_keeps_lease_across_ticks() {
        let cluster = Cluster::new();
        let node = cluster.node("node1", 50);

        for _ in 0..5 {
            assert_eq!(cluster.round(&[&node]).await, vec!["node1"]);
            tokio::time::sleep(TTL).await;
        }
        assert!(cluster.locks.is_held("job:ranking:lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_and_withdraws() {
        let cluster = Cluster::new();
        let node = cluster.node("node1", 50);
        cluster.round(&[&node]).await;
        assert!(node.is_leader().await);

        node.shutdown().await;
        assert!(!node.is_leader().await);
        assert!(!cluster.locks.is_held("job:ranking:lock"));
        assert!(cluster.board.leader("job:ranking").await.unwrap().is_none());

        assert!(cluster.round(&[&node]).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_refresh_updates_reported_load() {
        let probe = FixedLoad::new(50);
        let mut config = SingletonConfig::new("ranking");
        config.load_refresh = Duration::from_secs(10);
        let job = SingletonLeaderJob::new(
            NodeId::from("node1"),
            config,
            Arc::new(MemoryLoadBoard::new()),
            Arc::new(MemoryLockClient::new()),
            Arc::new(probe.clone()),
            Arc::new(Recorder {
                node: "node1".to_string(),
                log: Arc::new(StdMutex::new(Vec::new())),
            }),
        );
        let refresher = job.start_load_refresh();

        probe.set(5);
        assert_eq!(job.current_load(), 50);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(job.current_load(), 5);

        job.shutdown().await;
        refresher.await.unwrap();
    }
}
