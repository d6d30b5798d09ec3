//! Job repository.
//!
//! Claiming is optimistic: a worker selects a due row, then flips it to
//! running with an update guarded by the version it read. Losing that race
//! affects zero rows and the worker simply selects again. Every later write
//! by the holder is fenced on the claimed version, so a holder whose lease
//! was reclaimed can no longer touch the row.

use std::time::Duration;

use async_trait::async_trait;
use baton_core::{Job, JobDefinition, JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use crate::{DbError, DbResult};

/// A job record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub name: String,
    pub executor: String,
    pub expression: String,
    pub status: String,
    pub version: i64,
    pub next_time: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub utime: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| DbError::InvalidRow(format!("job {} has status {}", row.id, row.status)))?;
        Ok(Job {
            id: JobId::new(row.id),
            name: row.name,
            executor: row.executor,
            expression: row.expression,
            status,
            version: row.version,
            next_time: row.next_time,
            ctime: row.ctime,
            utime: row.utime,
        })
    }
}

/// Claim-side operations used by schedulers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim the least recently touched due job, so a job that keeps failing
    /// cannot starve the others. Returns [`DbError::NoJobs`] when nothing is due.
    /// The returned job carries the bumped version that fences later writes.
    async fn preempt(&self) -> DbResult<Job>;

    /// Schedule the next run at `next_time` and hand the job back.
    async fn update_next_time(&self, job: &Job, next_time: DateTime<Utc>) -> DbResult<()>;

    /// Lease heartbeat. Returns [`DbError::LeaseLost`] if the claim was revoked.
    async fn update_utime(&self, job: &Job) -> DbResult<()>;

    /// Hand the job back without touching `next_time`.
    async fn release(&self, job: &Job) -> DbResult<()>;

    /// Return running jobs whose heartbeat is older than `older_than` to
    /// waiting, revoking their holders. Returns how many were reclaimed.
    async fn reclaim_stale(&self, older_than: Duration) -> DbResult<u64>;
}

/// Operator-side operations on job definitions.
#[async_trait]
pub trait JobAdmin: Send + Sync {
    /// Insert a definition, or update the executor and expression of the job
    /// with the same name. A changed expression reschedules the job.
    async fn upsert_definition(&self, definition: &JobDefinition) -> DbResult<Job>;
    async fn get_by_name(&self, name: &str) -> DbResult<Job>;
    async fn list(&self) -> DbResult<Vec<Job>>;
    /// Pause or resume scheduling. Resuming schedules the next fire time from now.
    async fn set_paused(&self, name: &str, paused: bool) -> DbResult<Job>;
}

/// PostgreSQL implementation of JobStore.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn preempt(&self) -> DbResult<Job> {
        loop {
            let candidate = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM jobs
                WHERE status = 'waiting' AND next_time < NOW()
                ORDER BY utime, id
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NoJobs)?;

            let claimed = sqlx::query_as::<_, JobRow>(
                r#"
                UPDATE jobs
                SET status = 'running', version = version + 1, utime = NOW()
                WHERE id = $1 AND version = $2
                RETURNING *
                "#,
            )
            .bind(candidate.id)
            .bind(candidate.version)
            .fetch_optional(&self.pool)
            .await?;

            match claimed {
                Some(row) => return row.try_into(),
                None => {
                    debug!(job_id = candidate.id, version = candidate.version, "Lost preemption race");
                }
            }
        }
    }

    async fn update_next_time(&self, job: &Job, next_time: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET next_time = $3, status = 'waiting', utime = NOW()
            WHERE id = $1 AND version = $2 AND status = 'running'
            "#,
        )
        .bind(job.id.get())
        .bind(job.version)
        .bind(next_time)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            debug!(job_id = %job.id, "Next time not recorded, lease already revoked");
        }
        Ok(())
    }

    async fn update_utime(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET utime = NOW() WHERE id = $1 AND version = $2")
            .bind(job.id.get())
            .bind(job.version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::LeaseLost(job.id));
        }
        Ok(())
    }

    async fn release(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', utime = NOW()
            WHERE id = $1 AND version = $2 AND status = 'running'
            "#,
        )
        .bind(job.id.get())
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            debug!(job_id = %job.id, "Nothing to release");
        }
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', version = version + 1, utime = NOW()
            WHERE status = 'running'
              AND utime < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(older_than.as_millis() as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobAdmin for PgJobStore {
    async fn upsert_definition(&self, definition: &JobDefinition) -> DbResult<Job> {
        let next_time = definition.first_fire_time(Utc::now())?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (name, executor, expression, status, version, next_time, ctime, utime)
            VALUES ($1, $2, $3, 'waiting', 0, $4, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE
            SET executor = EXCLUDED.executor,
                expression = EXCLUDED.expression,
                next_time = CASE
                    WHEN jobs.expression <> EXCLUDED.expression THEN EXCLUDED.next_time
                    ELSE jobs.next_time
                END,
                utime = NOW()
            RETURNING *
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.executor)
        .bind(&definition.expression)
        .bind(next_time)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", name)))?
            .try_into()
    }

    async fn list(&self) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn set_paused(&self, name: &str, paused: bool) -> DbResult<Job> {
        let job = self.get_by_name(name).await?;
        let row = if paused {
            sqlx::query_as::<_, JobRow>(
                "UPDATE jobs SET status = 'paused', utime = NOW() WHERE id = $1 RETURNING *",
            )
            .bind(job.id.get())
            .fetch_one(&self.pool)
            .await?
        } else {
            if job.status != JobStatus::Paused {
                return Ok(job);
            }
            let next_time = job.next_time_after(Utc::now())?;
            sqlx::query_as::<_, JobRow>(
                r#"
                UPDATE jobs
                SET status = 'waiting', next_time = $2, utime = NOW()
                WHERE id = $1 AND status = 'paused'
                RETURNING *
                "#,
            )
            .bind(job.id.get())
            .bind(next_time)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("paused job {}", name)))?
        };
        row.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_row(status: &str) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: 3,
            name: "ranking".to_string(),
            executor: "local".to_string(),
            expression: "0 */1 * * * *".to_string(),
            status: status.to_string(),
            version: 3,
            next_time: now,
            ctime: now,
            utime: now,
        }
    }

    #[test]
    fn test_row_conversion() {
        let job = Job::try_from(make_row("running")).unwrap();
        assert_eq!(job.id, JobId::new(3));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.version, 3);
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let result = Job::try_from(make_row("done"));
        assert!(matches!(result, Err(DbError::InvalidRow(_))));
    }

    /// Requires a PostgreSQL instance; run with `DATABASE_URL=... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_pg_preempt_claims_once() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::create_pool(&url, 4).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let name = format!("pg-preempt-{}", uuid_suffix());
        store
            .upsert_definition(&JobDefinition::new(&name, "local", "* * * * * *"))
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET next_time = NOW() - INTERVAL '1 minute' WHERE name = $1")
            .bind(&name)
            .execute(&store.pool)
            .await
            .unwrap();

        let (a, b) = tokio::join!(store.preempt(), store.preempt());
        let claimed: Vec<_> = [a, b]
            .into_iter()
            .filter_map(|r| r.ok())
            .filter(|job| job.name == name)
            .collect();
        assert_eq!(claimed.len(), 1);
        let job = &claimed[0];
        assert_eq!(job.status, JobStatus::Running);

        store.release(job).await.unwrap();
        let released = store.get_by_name(&name).await.unwrap();
        assert_eq!(released.status, JobStatus::Waiting);
        assert_eq!(released.version, job.version);
    }

    fn uuid_suffix() -> String {
        Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
    }
}
