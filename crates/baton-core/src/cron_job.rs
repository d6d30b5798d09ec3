//! Locally ticked jobs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// A unit of work driven by a local periodic trigger rather than by job
/// preemption.
#[async_trait]
pub trait CronJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

#[async_trait]
impl<T: CronJob + ?Sized> CronJob for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(&self) -> Result<()> {
        (**self).run().await
    }
}
