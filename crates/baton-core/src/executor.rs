//! Executor trait and registry.
//!
//! A job row names the executor that knows how to run it. Executors are
//! registered once at process start; the scheduler looks them up by name for
//! every job it preempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{Error, Job, Result};

/// Trait for job executors.
///
/// Implementations must be safe to call concurrently for different jobs and
/// should return promptly once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor. Jobs reference it through [`Job::executor`].
    fn name(&self) -> &str;

    /// Run one preempted job to completion.
    async fn exec(&self, cancel: CancellationToken, job: &Job) -> Result<()>;
}

/// Executors available to a scheduler, keyed by [`Executor::name`].
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one with the same name.
    pub fn register(&mut self, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(executor.name().to_string(), executor);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

type JobFn = Arc<dyn Fn(CancellationToken, Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Executor that runs in-process functions, dispatching on the job name.
#[derive(Default, Clone)]
pub struct LocalExecutor {
    funcs: HashMap<String, JobFn>,
}

impl LocalExecutor {
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function run for jobs named `job_name`.
    pub fn register_fn<F, Fut>(&mut self, job_name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CancellationToken, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f: JobFn = Arc::new(move |cancel, job| f(cancel, job).boxed());
        self.funcs.insert(job_name.into(), f);
        self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn exec(&self, cancel: CancellationToken, job: &Job) -> Result<()> {
        let f = self
            .funcs
            .get(&job.name)
            .ok_or_else(|| Error::NotFound(format!("no local function for job {}", job.name)))?;
        f(cancel, job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobId, JobStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_job(name: &str) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(7),
            name: name.to_string(),
            executor: LocalExecutor::NAME.to_string(),
            expression: "0 * * * * *".to_string(),
            status: JobStatus::Running,
            version: 1,
            next_time: now,
            ctime: now,
            utime: now,
        }
    }

    #[tokio::test]
    async fn test_local_executor_dispatches_by_job_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut local = LocalExecutor::new();
        let counter = calls.clone();
        local.register_fn("ranking", move |_cancel, job| {
            let counter = counter.clone();
            async move {
                assert_eq!(job.name, "ranking");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        local
            .exec(CancellationToken::new(), &make_job("ranking"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_executor_unknown_job() {
        let local = LocalExecutor::new();
        let result = local
            .exec(CancellationToken::new(), &make_job("missing"))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(LocalExecutor::new()));

        assert!(registry.get("local").is_some());
        assert!(registry.get("remote").is_none());
        assert_eq!(registry.names(), vec!["local"]);
    }
}
