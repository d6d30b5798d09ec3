//! The preemption loop.
//!
//! Each scheduler instance claims due jobs from a shared [`JobStore`] and runs
//! them on registered executors, at most `max_concurrency` at a time. Any
//! number of instances, in any number of processes, can share one store;
//! versioned claims keep each run exclusive.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use baton_config::SchedulerConfig;
use baton_core::{Error, Executor, ExecutorRegistry, Job};
use baton_db::{DbError, JobStore};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::lease::RunningJob;

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executors: ExecutorRegistry,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: ExecutorRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executors,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            tracker: TaskTracker::new(),
        }
    }

    /// Jobs that could start right now without waiting for a running one.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run until `shutdown` fires, then wait up to the shutdown grace period
    /// for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_concurrency = self.config.max_concurrency,
            executors = ?self.executors.names(),
            "Starting scheduler"
        );

        let mut reclaim = tokio::time::interval(self.config.reclaim_interval);
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = reclaim.tick() => {
                    self.reclaim().await;
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match tokio::time::timeout(self.config.store_timeout, self.store.preempt()).await {
                Ok(Ok(job)) => self.dispatch(job, permit, &shutdown).await,
                Ok(Err(DbError::NoJobs)) => {
                    drop(permit);
                    self.backoff(self.config.idle_backoff, &shutdown).await;
                }
                Ok(Err(e)) => {
                    drop(permit);
                    warn!(error = %e, "Failed to preempt job");
                    self.backoff(self.config.error_backoff, &shutdown).await;
                }
                Err(_) => {
                    drop(permit);
                    warn!("Timed out preempting job");
                    self.backoff(self.config.error_backoff, &shutdown).await;
                }
            }
        }

        self.drain().await;
    }

    async fn dispatch(
        &self,
        job: Job,
        permit: OwnedSemaphorePermit,
        shutdown: &CancellationToken,
    ) {
        let Some(executor) = self.executors.get(&job.executor) else {
            warn!(
                job_id = %job.id,
                name = %job.name,
                executor = %job.executor,
                "No executor registered, releasing job"
            );
            let release = self.store.release(&job);
            match tokio::time::timeout(self.config.store_timeout, release).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "Failed to release job"),
                Err(_) => warn!(job_id = %job.id, "Timed out releasing job"),
            }
            drop(permit);
            self.backoff(self.config.error_backoff, shutdown).await;
            return;
        };

        let running = RunningJob::start(
            self.store.clone(),
            job,
            shutdown,
            self.config.renew_interval,
            self.config.store_timeout,
        );
        let store = self.store.clone();
        let store_timeout = self.config.store_timeout;

        self.tracker.spawn(async move {
            execute(store, executor, running, store_timeout).await;
            drop(permit);
        });
    }

    async fn reclaim(&self) {
        let reclaim = self.store.reclaim_stale(self.config.stale_after);
        match tokio::time::timeout(self.config.store_timeout, reclaim).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(reclaimed = n, "Reclaimed stale jobs"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reclaim stale jobs"),
            Err(_) => warn!("Timed out reclaiming stale jobs"),
        }
    }

    async fn backoff(&self, delay: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn drain(&self) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Scheduler stopping");
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                "Shutdown grace period elapsed with jobs still running"
            );
        }
    }
}

async fn execute(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    running: RunningJob,
    store_timeout: Duration,
) {
    let job = running.job().clone();
    info!(
        job_id = %job.id,
        name = %job.name,
        executor = executor.name(),
        version = job.version,
        "Executing job"
    );

    let result = match AssertUnwindSafe(executor.exec(running.token(), &job))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Internal(format!(
            "executor {} panicked",
            executor.name()
        ))),
    };

    match result {
        Ok(()) => match job.next_time_after(Utc::now()) {
            Ok(next_time) => {
                let update = store.update_next_time(&job, next_time);
                match tokio::time::timeout(store_timeout, update).await {
                    Ok(Ok(())) => debug!(job_id = %job.id, %next_time, "Job rescheduled"),
                    Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "Failed to reschedule job"),
                    Err(_) => warn!(job_id = %job.id, "Timed out rescheduling job"),
                }
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Cannot compute next fire time"),
        },
        Err(e) => error!(job_id = %job.id, name = %job.name, error = %e, "Job failed"),
    }

    running.finish().await;
}
