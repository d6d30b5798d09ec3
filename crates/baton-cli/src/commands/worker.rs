//! The long-running worker process.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use baton_config::{SingletonConfig, WorkerConfig, load_worker_config};
use baton_core::{CronJob, ExecutorRegistry, Job, LocalExecutor, NodeId};
use baton_db::JobAdmin;
use baton_lock::{ConnectionManager, RedisLoadBoard, RedisLockClient};
use baton_scheduler::{
    CronJobAdapter, JobMetrics, RandomLoad, Scheduler, SingletonLeaderJob, Ticker,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::{Urls, connect_store};

/// Body of a singleton job that only reports that it ran.
struct LogOnly {
    name: String,
}

#[async_trait]
impl CronJob for LogOnly {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> baton_core::Result<()> {
        info!(job = %self.name, "Singleton job ran on this node");
        Ok(())
    }
}

/// Run the scheduler and all configured singletons until Ctrl-C.
pub async fn run(urls: &Urls, config_path: &str) -> Result<()> {
    let config = load_worker_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;
    let node = config
        .node_id
        .clone()
        .map(NodeId::from)
        .unwrap_or_default();
    info!(
        node = %node,
        jobs = config.jobs.len(),
        singletons = config.singletons.len(),
        "Starting worker"
    );

    let store = connect_store(&urls.database(Some(&config))?, config.max_connections).await?;
    for definition in &config.jobs {
        store
            .upsert_definition(definition)
            .await
            .with_context(|| format!("Failed to apply job {}", definition.name))?;
    }

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let singletons = start_singletons(urls, &config, &node, &tracker, &shutdown).await?;

    let scheduler = Scheduler::new(
        Arc::new(store),
        local_executors(&config),
        config.scheduler.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        });
    }

    // Returns once cancelled and drained.
    scheduler.run(shutdown.clone()).await;

    tracker.close();
    tracker.wait().await;
    for singleton in singletons {
        singleton.shutdown().await;
    }

    info!("Worker stopped");
    Ok(())
}

/// Executors for this process: a local executor with one logging function
/// per configured job that names it.
fn local_executors(config: &WorkerConfig) -> ExecutorRegistry {
    let mut local = LocalExecutor::new();
    for definition in &config.jobs {
        if definition.executor != LocalExecutor::NAME {
            continue;
        }
        local.register_fn(definition.name.clone(), |_cancel, job: Job| async move {
            info!(job_id = %job.id, name = %job.name, version = job.version, "Local job fired");
            Ok(())
        });
    }

    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(local));
    executors
}

async fn start_singletons(
    urls: &Urls,
    config: &WorkerConfig,
    node: &NodeId,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) -> Result<Vec<Arc<SingletonLeaderJob>>> {
    if config.singletons.is_empty() {
        return Ok(Vec::new());
    }

    let redis = baton_lock::connect(&urls.redis(config)?)
        .await
        .context("Failed to connect to Redis")?;
    let board = Arc::new(RedisLoadBoard::new(redis.clone()));
    let metrics = JobMetrics::register_default()?;

    let mut started = Vec::new();
    for singleton in &config.singletons {
        let job = Arc::new(singleton_job(singleton, node, &board, &redis));
        job.start_load_refresh();

        let ticker = Ticker::new(
            CronJobAdapter::new(job.clone(), metrics.clone()),
            singleton.interval,
        );
        tracker.spawn(ticker.run(shutdown.clone()));
        info!(job = %singleton.name, key = %singleton.key, "Singleton job scheduled");
        started.push(job);
    }
    Ok(started)
}

fn singleton_job(
    singleton: &SingletonConfig,
    node: &NodeId,
    board: &Arc<RedisLoadBoard>,
    redis: &ConnectionManager,
) -> SingletonLeaderJob {
    SingletonLeaderJob::new(
        node.clone(),
        singleton.clone(),
        board.clone(),
        Arc::new(RedisLockClient::new(redis.clone(), singleton.lock_timeout)),
        Arc::new(RandomLoad::default()),
        Arc::new(LogOnly {
            name: singleton.name.clone(),
        }),
    )
}
