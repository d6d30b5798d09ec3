//! Local periodic triggering of [`CronJob`]s.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use baton_core::{CronJob, Error, Result};
use futures::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::JobMetrics;

/// Wraps a [`CronJob`] with logging, panic containment and duration metrics.
pub struct CronJobAdapter {
    job: Arc<dyn CronJob>,
    metrics: JobMetrics,
}

impl CronJobAdapter {
    pub fn new(job: Arc<dyn CronJob>, metrics: JobMetrics) -> Self {
        Self { job, metrics }
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    /// Run the job once. Failures are logged and recorded, never returned.
    pub async fn invoke(&self) {
        let name = self.job.name();
        let start = Instant::now();
        debug!(job = name, "Starting cron job");

        let result = match AssertUnwindSafe(self.job.run()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(format!("cron job {} panicked", name))),
        };

        if let Err(e) = &result {
            error!(job = name, error = %e, "Cron job failed");
        }
        let elapsed = start.elapsed();
        debug!(job = name, elapsed_ms = elapsed.as_millis() as u64, "Cron job finished");
        self.metrics.observe(name, result.is_ok(), elapsed);
    }
}

/// Drives a [`CronJobAdapter`] every `interval` until cancelled.
pub struct Ticker {
    adapter: CronJobAdapter,
    interval: Duration,
}

impl Ticker {
    pub fn new(adapter: CronJobAdapter, interval: Duration) -> Self {
        Self { adapter, interval }
    }

    /// Tick immediately, then every `interval`. Ticks missed while a run is in
    /// progress are skipped rather than replayed.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            job = self.adapter.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting ticker"
        );
        let mut ticker = tokio::time::interval_at(Instant::now(), self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.adapter.invoke().await,
            }
        }

        info!(job = self.adapter.name(), "Ticker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        runs: AtomicU32,
    }

    #[async_trait]
    impl CronJob for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self) -> Result<()> {
            match self.runs.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::ExecutionFailed("first run fails".into())),
                1 => panic!("second run panics"),
                _ => Ok(()),
            }
        }
    }

    fn metrics() -> JobMetrics {
        JobMetrics::new(&Registry::new()).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_contains_errors_and_panics() {
        let job = Arc::new(Flaky {
            runs: AtomicU32::new(0),
        });
        let metrics = metrics();
        let adapter = CronJobAdapter::new(job.clone(), metrics.clone());

        adapter.invoke().await;
        adapter.invoke().await;
        adapter.invoke().await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.count("flaky", false), 2);
        assert_eq!(metrics.count("flaky", true), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_keeps_running_after_failures() {
        let job = Arc::new(Flaky {
            runs: AtomicU32::new(0),
        });
        let ticker = Ticker::new(
            CronJobAdapter::new(job.clone(), metrics()),
            Duration::from_secs(10),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ticker.run(cancel.clone()));

        // Ticks at 0s, 10s, 20s and 30s.
        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(job.runs.load(Ordering::SeqCst), 4);
    }
}
