//! Prometheus metrics for locally ticked jobs.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, Registry};

/// Run durations in seconds, labelled by job name and outcome.
#[derive(Clone)]
pub struct JobMetrics {
    durations: HistogramVec,
}

impl JobMetrics {
    /// Create the histogram and register it with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "baton_cron_job_duration_seconds",
                "Duration of cron job runs in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["job", "success"],
        )?;
        registry.register(Box::new(durations.clone()))?;
        Ok(Self { durations })
    }

    /// Register on the process-wide default registry, where
    /// `prometheus::gather()` finds it.
    pub fn register_default() -> Result<Self, prometheus::Error> {
        Self::new(prometheus::default_registry())
    }

    pub fn observe(&self, job: &str, success: bool, elapsed: Duration) {
        self.durations
            .with_label_values(&[job, if success { "true" } else { "false" }])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of observed runs for `job` with the given outcome.
    pub fn count(&self, job: &str, success: bool) -> u64 {
        self.durations
            .get_metric_with_label_values(&[job, if success { "true" } else { "false" }])
            .map(|h| h.get_sample_count())
            .unwrap_or(0)
    }
}
