//! Lease renewal for preempted jobs.

use std::sync::Arc;
use std::time::Duration;

use baton_core::Job;
use baton_db::{DbError, JobStore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A preempted job whose lease is kept alive in the background.
///
/// The execution token is cancelled when the scheduler shuts down or when a
/// heartbeat finds the lease revoked. [`RunningJob::finish`] stops renewal
/// and hands the job back; dropping without finishing only stops renewal.
pub struct RunningJob {
    job: Job,
    store: Arc<dyn JobStore>,
    store_timeout: Duration,
    token: CancellationToken,
    stop: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl RunningJob {
    pub fn start(
        store: Arc<dyn JobStore>,
        job: Job,
        shutdown: &CancellationToken,
        renew_interval: Duration,
        store_timeout: Duration,
    ) -> Self {
        let token = shutdown.child_token();
        let stop = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            store.clone(),
            job.clone(),
            renew_interval,
            store_timeout,
            stop.clone(),
            token.clone(),
        ));

        Self {
            job,
            store,
            store_timeout,
            token,
            stop,
            renewal: Some(renewal),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Cancelled once the execution should stop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop renewing and release the claim. A job already rescheduled or
    /// reclaimed elsewhere is left alone.
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.await;
        }

        match tokio::time::timeout(self.store_timeout, self.store.release(&self.job)).await {
            Ok(Ok(())) => debug!(job_id = %self.job.id, "Released job"),
            Ok(Err(e)) => warn!(job_id = %self.job.id, error = %e, "Failed to release job"),
            Err(_) => warn!(job_id = %self.job.id, "Timed out releasing job"),
        }
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

async fn renew(
    store: Arc<dyn JobStore>,
    job: Job,
    interval: Duration,
    store_timeout: Duration,
    stop: CancellationToken,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(store_timeout, store.update_utime(&job)).await {
            Ok(Ok(())) => debug!(job_id = %job.id, "Renewed lease"),
            Ok(Err(DbError::LeaseLost(_))) => {
                warn!(job_id = %job.id, version = job.version, "Lease lost, cancelling execution");
                token.cancel();
                return;
            }
            Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "Failed to renew lease"),
            Err(_) => warn!(job_id = %job.id, "Timed out renewing lease"),
        }
    }
}
