//! In-memory job store.
//!
//! Mirrors the PostgreSQL semantics, including the two-step
//! select-then-conditional-update claim: selection and the versioned update
//! take the lock separately, so concurrent claimers genuinely race and the
//! loser observes a version mismatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::{Job, JobDefinition, JobId, JobStatus};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{DbError, DbResult, JobAdmin, JobStore};

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    next_id: i64,
}

/// Job store kept in process memory. Clones share the same jobs.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
    conflicts: Arc<AtomicU64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave a job half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a job as-is, assigning an id when `job.id` is zero.
    pub fn insert(&self, mut job: Job) -> Job {
        let mut state = self.state();
        if job.id.get() == 0 {
            state.next_id += 1;
            job.id = JobId::new(state.next_id);
        } else {
            state.next_id = state.next_id.max(job.id.get());
        }
        state.jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state().jobs.get(&id).cloned()
    }

    /// Number of claims lost to a concurrent claimer.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    fn select_due(&self, now: DateTime<Utc>) -> Option<Job> {
        self.state()
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .min_by_key(|job| (job.utime, job.id))
            .cloned()
    }

    /// Versioned claim: succeeds only if the row still has `version`.
    fn claim(&self, id: JobId, version: i64, now: DateTime<Utc>) -> Option<Job> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&id)?;
        if job.version != version {
            return None;
        }
        job.status = JobStatus::Running;
        job.version += 1;
        job.utime = now;
        Some(job.clone())
    }

    /// Apply `f` to the row if it is still held at `job.version`.
    fn with_lease(&self, job: &Job, f: impl FnOnce(&mut Job)) -> bool {
        let mut state = self.state();
        match state.jobs.get_mut(&job.id) {
            Some(row) if row.version == job.version => {
                f(row);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn preempt(&self) -> DbResult<Job> {
        loop {
            let candidate = self.select_due(Utc::now()).ok_or(DbError::NoJobs)?;

            // Let other claimers interleave between select and update.
            tokio::task::yield_now().await;

            match self.claim(candidate.id, candidate.version, Utc::now()) {
                Some(job) => return Ok(job),
                None => {
                    self.conflicts.fetch_add(1, Ordering::SeqCst);
                    debug!(job_id = %candidate.id, version = candidate.version, "Lost preemption race");
                }
            }
        }
    }

    async fn update_next_time(&self, job: &Job, next_time: DateTime<Utc>) -> DbResult<()> {
        let now = Utc::now();
        let updated = self.with_lease(job, |row| {
            if row.status == JobStatus::Running {
                row.next_time = next_time;
                row.status = JobStatus::Waiting;
                row.utime = now;
            }
        });
        if !updated {
            debug!(job_id = %job.id, "Next time not recorded, lease already revoked");
        }
        Ok(())
    }

    async fn update_utime(&self, job: &Job) -> DbResult<()> {
        let now = Utc::now();
        if self.with_lease(job, |row| row.utime = now) {
            Ok(())
        } else {
            Err(DbError::LeaseLost(job.id))
        }
    }

    async fn release(&self, job: &Job) -> DbResult<()> {
        let now = Utc::now();
        let released = self.with_lease(job, |row| {
            if row.status == JobStatus::Running {
                row.status = JobStatus::Waiting;
                row.utime = now;
            }
        });
        if !released {
            debug!(job_id = %job.id, "Nothing to release");
        }
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> DbResult<u64> {
        let now = Utc::now();
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| baton_core::Error::InvalidInput(e.to_string()))?;
        let cutoff = now - older_than;

        let mut reclaimed = 0;
        for job in self.state().jobs.values_mut() {
            if job.status == JobStatus::Running && job.utime < cutoff {
                job.status = JobStatus::Waiting;
                job.version += 1;
                job.utime = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl JobAdmin for MemoryJobStore {
    async fn upsert_definition(&self, definition: &JobDefinition) -> DbResult<Job> {
        let now = Utc::now();
        let next_time = definition.first_fire_time(now)?;

        let existing = self
            .state()
            .jobs
            .values_mut()
            .find(|job| job.name == definition.name)
            .map(|job| {
                if job.expression != definition.expression {
                    job.next_time = next_time;
                }
                job.executor = definition.executor.clone();
                job.expression = definition.expression.clone();
                job.utime = now;
                job.clone()
            });

        Ok(existing.unwrap_or_else(|| {
            self.insert(Job {
                id: JobId::new(0),
                name: definition.name.clone(),
                executor: definition.executor.clone(),
                expression: definition.expression.clone(),
                status: JobStatus::Waiting,
                version: 0,
                next_time,
                ctime: now,
                utime: now,
            })
        }))
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Job> {
        self.state()
            .jobs
            .values()
            .find(|job| job.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", name)))
    }

    async fn list(&self) -> DbResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.state().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn set_paused(&self, name: &str, paused: bool) -> DbResult<Job> {
        let job = self.get_by_name(name).await?;
        let now = Utc::now();
        let next_time = if !paused && job.status == JobStatus::Paused {
            Some(job.next_time_after(now)?)
        } else {
            None
        };

        let mut state = self.state();
        let row = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", name)))?;
        if paused {
            row.status = JobStatus::Paused;
            row.utime = now;
        } else if let Some(next_time) = next_time {
            row.status = JobStatus::Waiting;
            row.next_time = next_time;
            row.utime = now;
        }
        Ok(row.clone())
    }
}
