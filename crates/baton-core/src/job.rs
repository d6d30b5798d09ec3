//! Job definitions and their scheduling state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::{Error, JobId, Result};

/// Claim state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Nobody holds the job; it may be preempted once `next_time` has passed.
    Waiting,
    /// A worker preempted the job and holds its lease.
    Running,
    /// Taken out of scheduling by an operator.
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Unique human label. Also the key a [`crate::executor::LocalExecutor`] dispatches on.
    pub name: String,
    /// Key into the executor registry.
    pub executor: String,
    /// Cron expression, seconds field first.
    pub expression: String,
    pub status: JobStatus,
    /// Optimistic-concurrency token, bumped on every claim.
    pub version: i64,
    pub next_time: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    /// Last touched; doubles as the lease heartbeat while running.
    pub utime: DateTime<Utc>,
}

impl Job {
    /// Whether the job may be preempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.next_time < now
    }

    /// The next instant strictly after `after` at which this job should fire.
    pub fn next_time_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        next_fire_time(&self.expression, after)
    }
}

/// An operator-provided job definition, upserted by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub executor: String,
    pub expression: String,
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        executor: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            executor: executor.into(),
            expression: expression.into(),
        }
    }

    /// Check the definition and return its first fire time after `now`.
    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("job name is empty".to_string()));
        }
        if self.executor.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job {} has no executor",
                self.name
            )));
        }
        next_fire_time(&self.expression, now)
    }
}

/// Parse a cron expression, mapping the parser error into ours.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|e| Error::Schedule {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// The first fire time of `expression` strictly after `after`.
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_schedule(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| Error::Schedule {
            expression: expression.to_string(),
            message: "schedule has no future fire time".to_string(),
        })
}
