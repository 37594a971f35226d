//! Persistence for [`Job`]s and their [`JobExecution`]s.
//!
//! Grounded on `original_source/background/db.go`: a `jobs` table and a
//! `job_executions` table (one-to-many, cascade-deleted with their job),
//! a transactional upsert in [`JobStore::store`], and a claim step that
//! hands a batch of unowned or stale-heartbeat jobs to one worker.
//!
//! The claim departs from the original in one respect: the reference
//! implementation claims in two statements (a locking `SELECT ... FOR
//! UPDATE` followed by a separate `UPDATE`) inside one transaction.
//! `sqlx`'s `RETURNING` lets `PostgresJobStore::claim_for` do both in a
//! single `UPDATE ... RETURNING`, which is equivalent under Postgres'
//! MVCC and removes a statement from the hot path.

use crate::domain::{ExecutionStatus, Job, JobExecution};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// How long a claimed job may go without a heartbeat before another worker
/// is allowed to claim it.
pub const HEARTBEAT_LEASE: ChronoDuration = ChronoDuration::minutes(10);

/// Errors raised while loading or persisting jobs.
#[derive(Error, Debug)]
pub enum JobStoreError {
    /// The underlying database call failed.
    #[error("job store error: {0}")]
    Database(String),

    /// [`JobStore::get_one`] found no job with the given id.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// A stored execution status column held a value [`ExecutionStatus`]
    /// doesn't recognize.
    #[error(transparent)]
    UnknownStatus(#[from] crate::domain::JobError),
}

/// Persists [`Job`]s and leases them out to workers.
///
/// Uses the same `Pin<Box<dyn Future>>` dyn-compatible style as
/// [`cqrs_core::event_store::EventStore`] and [`cqrs_core::queue::Queue`].
pub trait JobStore: Send + Sync {
    /// Upsert `job` and every execution it currently holds, in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the write fails.
    fn store(&self, job: Job) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>>;

    /// Load one job, with its executions, by id.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::NotFound`] if no such job exists, or
    /// [`JobStoreError::Database`] on a lower-level failure.
    fn get_one(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Job, JobStoreError>> + Send + '_>>;

    /// Every job in the table, with their executions.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the read fails.
    fn all(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Job>, JobStoreError>> + Send + '_>>;

    /// Claim every unowned or stale-heartbeat job for `worker_id`, resetting
    /// any of its executions that were left `Processing` by a prior worker
    /// back to `Waiting`.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the claim fails.
    fn claim_for(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>>;

    /// Refresh `worker_id`'s heartbeat on every job it currently owns.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the update fails.
    fn heartbeat(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>>;

    /// Every job currently owned by `worker_id`, with their executions.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the read fails.
    fn get_for(
        &self,
        worker_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>, JobStoreError>> + Send + '_>>;
}

/// A `PostgreSQL`-backed [`JobStore`].
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connect to `database_url` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if the connection or schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, ensuring the schema exists.
    ///
    /// # Errors
    ///
    /// [`JobStoreError::Database`] if schema setup fails.
    pub async fn from_pool(pool: PgPool) -> Result<Self, JobStoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                frequency_minutes INT,
                system_job BOOLEAN NOT NULL,
                task BYTEA NOT NULL,
                user_id UUID,
                worker UUID,
                heartbeat TIMESTAMPTZ,
                active BOOLEAN NOT NULL,
                start_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claimable
                ON jobs (worker, heartbeat)
                WHERE active;

            CREATE TABLE IF NOT EXISTS job_executions (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                next TIMESTAMPTZ NOT NULL,
                scheduled_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_executions_job
                ON job_executions (job_id, created_at);
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn executions_for(&self, job_ids: &[Uuid]) -> Result<Vec<JobExecution>, JobStoreError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r"SELECT id, job_id, status, next, scheduled_at, completed_at, created_at
               FROM job_executions WHERE job_id = ANY($1)
               ORDER BY created_at ASC",
        )
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobStoreError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_execution).collect()
    }

    async fn jobs_from_rows(&self, rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = rows.into_iter().map(row_to_job).collect::<Result<_, _>>()?;
        let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        let executions = self.executions_for(&ids).await?;
        for job in &mut jobs {
            job.executions = executions.iter().filter(|e| e.job_id == job.id).cloned().collect();
        }
        Ok(jobs)
    }
}

impl JobStore for PostgresJobStore {
    fn store(&self, job: Job) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| JobStoreError::Database(e.to_string()))?;

            let frequency_minutes = job.frequency_minutes.map(|m| i32::try_from(m).unwrap_or(i32::MAX));
            sqlx::query(
                r"INSERT INTO jobs
                   (id, name, frequency_minutes, system_job, task, user_id, worker, heartbeat, active, start_at, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                   ON CONFLICT (id) DO UPDATE SET
                       name = EXCLUDED.name,
                       frequency_minutes = EXCLUDED.frequency_minutes,
                       system_job = EXCLUDED.system_job,
                       task = EXCLUDED.task,
                       user_id = EXCLUDED.user_id,
                       worker = EXCLUDED.worker,
                       heartbeat = EXCLUDED.heartbeat,
                       active = EXCLUDED.active,
                       start_at = EXCLUDED.start_at",
            )
            .bind(job.id)
            .bind(&job.name)
            .bind(frequency_minutes)
            .bind(job.system_job)
            .bind(&job.task)
            .bind(job.user_id)
            .bind(job.worker)
            .bind(job.heartbeat)
            .bind(job.active)
            .bind(job.start_at)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;

            for execution in &job.executions {
                sqlx::query(
                    r"INSERT INTO job_executions
                       (id, job_id, status, next, scheduled_at, completed_at, created_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7)
                       ON CONFLICT (id) DO UPDATE SET
                           status = EXCLUDED.status,
                           next = EXCLUDED.next,
                           scheduled_at = EXCLUDED.scheduled_at,
                           completed_at = EXCLUDED.completed_at",
                )
                .bind(execution.id)
                .bind(execution.job_id)
                .bind(execution.status.as_str())
                .bind(execution.next)
                .bind(execution.scheduled_at)
                .bind(execution.completed_at)
                .bind(execution.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| JobStoreError::Database(e.to_string()))?;
            }

            tx.commit().await.map_err(|e| JobStoreError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_one(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Job, JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"SELECT id, name, frequency_minutes, system_job, task, user_id, worker, heartbeat, active, start_at, created_at
                   FROM jobs WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;

            let Some(row) = row else {
                return Err(JobStoreError::NotFound(id));
            };
            let mut job = row_to_job(row)?;
            job.executions = self.executions_for(&[id]).await?;
            Ok(job)
        })
    }

    fn all(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Job>, JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"SELECT id, name, frequency_minutes, system_job, task, user_id, worker, heartbeat, active, start_at, created_at
                   FROM jobs",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
            self.jobs_from_rows(rows).await
        })
    }

    fn claim_for(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| JobStoreError::Database(e.to_string()))?;

            let claimed = sqlx::query(
                r"UPDATE jobs SET worker = $1, heartbeat = $2
                   WHERE active AND (worker IS NULL OR heartbeat < $2)
                   RETURNING id",
            )
            .bind(worker_id)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;

            if !claimed.is_empty() {
                let claimed_ids: Vec<Uuid> = claimed
                    .iter()
                    .map(|row| row.try_get("id").map_err(|e| JobStoreError::Database(e.to_string())))
                    .collect::<Result<_, _>>()?;

                sqlx::query(
                    r"UPDATE job_executions SET status = 'waiting'
                       WHERE status = 'processing' AND job_id = ANY($1)",
                )
                .bind(&claimed_ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| JobStoreError::Database(e.to_string()))?;
            }

            tx.commit().await.map_err(|e| JobStoreError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn heartbeat(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(r"UPDATE jobs SET heartbeat = $2 WHERE worker = $1")
                .bind(worker_id)
                .bind(now + HEARTBEAT_LEASE)
                .execute(&self.pool)
                .await
                .map_err(|e| JobStoreError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_for(
        &self,
        worker_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Job>, JobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"SELECT id, name, frequency_minutes, system_job, task, user_id, worker, heartbeat, active, start_at, created_at
                   FROM jobs WHERE worker = $1",
            )
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
            self.jobs_from_rows(rows).await
        })
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let frequency_minutes: Option<i32> = row.try_get("frequency_minutes").map_err(|e| JobStoreError::Database(e.to_string()))?;
    Ok(Job {
        id: row.try_get("id").map_err(|e| JobStoreError::Database(e.to_string()))?,
        name: row.try_get("name").map_err(|e| JobStoreError::Database(e.to_string()))?,
        frequency_minutes: frequency_minutes.map(|m| u32::try_from(m).unwrap_or(0)),
        system_job: row.try_get("system_job").map_err(|e| JobStoreError::Database(e.to_string()))?,
        task: row.try_get("task").map_err(|e| JobStoreError::Database(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| JobStoreError::Database(e.to_string()))?,
        worker: row.try_get("worker").map_err(|e| JobStoreError::Database(e.to_string()))?,
        heartbeat: row.try_get("heartbeat").map_err(|e| JobStoreError::Database(e.to_string()))?,
        active: row.try_get("active").map_err(|e| JobStoreError::Database(e.to_string()))?,
        start_at: row.try_get("start_at").map_err(|e| JobStoreError::Database(e.to_string()))?,
        executions: Vec::new(),
        created_at: row.try_get("created_at").map_err(|e| JobStoreError::Database(e.to_string()))?,
    })
}

fn row_to_execution(row: sqlx::postgres::PgRow) -> Result<JobExecution, JobStoreError> {
    let status: String = row.try_get("status").map_err(|e| JobStoreError::Database(e.to_string()))?;
    Ok(JobExecution {
        id: row.try_get("id").map_err(|e| JobStoreError::Database(e.to_string()))?,
        job_id: row.try_get("job_id").map_err(|e| JobStoreError::Database(e.to_string()))?,
        status: ExecutionStatus::parse(&status)?,
        next: row.try_get("next").map_err(|e| JobStoreError::Database(e.to_string()))?,
        scheduled_at: row.try_get("scheduled_at").map_err(|e| JobStoreError::Database(e.to_string()))?,
        completed_at: row.try_get("completed_at").map_err(|e| JobStoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| JobStoreError::Database(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_lease_is_ten_minutes() {
        assert_eq!(HEARTBEAT_LEASE, ChronoDuration::minutes(10));
    }
}
