//! PostgreSQL-backed store
//!
//! Time-dependent predicates are evaluated against the database clock so
//! that workers on different hosts agree on lease expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::{JobStore, ScanStore};
use crate::error::{WorkerError, WorkerResult};
use crate::queue::{Heartbeat, Job, JobState, JobType, LeasedJob, NewJob};
use crate::scan::{FileDescriptor, NewScanRun, ScanCounters, ScanFile, ScanRun, ScanState};

/// Advisory lock key serializing bounded inserts
const ENQUEUE_LOCK_KEY: i64 = 0x6a6f_625f_7175_6575;

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_after: i64,
    leased_until: Option<i64>,
    lease_owner: Option<String>,
    cancel_requested: bool,
    progress: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = WorkerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: row.job_id,
            job_type: JobType::new(row.job_type),
            payload: row.payload,
            state: row.state.parse()?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            run_after: row.run_after,
            leased_until: row.leased_until,
            lease_owner: row.lease_owner,
            cancel_requested: row.cancel_requested,
            progress: row.progress,
            result: row.result,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LeaseRow {
    job_id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    leased_until: i64,
    lease_owner: String,
    cancel_requested: bool,
}

impl From<LeaseRow> for LeasedJob {
    fn from(row: LeaseRow) -> Self {
        LeasedJob {
            job_id: row.job_id,
            job_type: JobType::new(row.job_type),
            payload: row.payload,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            leased_until: row.leased_until,
            lease_owner: row.lease_owner,
            cancel_requested: row.cancel_requested,
        }
    }
}

#[derive(Debug, FromRow)]
struct ScanRunRow {
    scan_id: String,
    job_id: Uuid,
    user_id: String,
    root_path: String,
    state: String,
    files_discovered: i64,
    files_persisted: i64,
    batches_flushed: i64,
    errors: i64,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScanRunRow> for ScanRun {
    type Error = WorkerError;

    fn try_from(row: ScanRunRow) -> Result<Self, Self::Error> {
        Ok(ScanRun {
            scan_id: row.scan_id,
            job_id: row.job_id,
            user_id: row.user_id,
            root_path: row.root_path,
            state: row.state.parse()?,
            counters: ScanCounters {
                files_discovered: row.files_discovered,
                files_persisted: row.files_persisted,
                batches_flushed: row.batches_flushed,
                errors: row.errors,
            },
            last_error: row.last_error,
            started_at: row.started_at,
            finished_at: row.finished_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScanFileRow {
    scan_file_id: Uuid,
    scan_id: String,
    path: String,
    size_bytes: i64,
    mtime_ms: i64,
    extension: String,
}

impl From<ScanFileRow> for ScanFile {
    fn from(row: ScanFileRow) -> Self {
        ScanFile {
            scan_file_id: row.scan_file_id,
            scan_id: row.scan_id,
            path: row.path,
            size_bytes: row.size_bytes,
            mtime_ms: row.mtime_ms,
            extension: row.extension,
        }
    }
}

/// [`JobStore`] and [`ScanStore`] over a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, job_type = %job.job_type))]
    async fn insert_job_bounded(&self, job: NewJob, max_queued: i64) -> WorkerResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Count-then-insert must not interleave with another enqueue
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ENQUEUE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_queue (job_id, job_type, payload, state, max_attempts, run_after)
            SELECT $1, $2, $3, 'queued', $4,
                   COALESCE($5, FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT)
            WHERE (SELECT COUNT(*) FROM job_queue WHERE state = 'queued') < $6
            "#,
        )
        .bind(job.job_id)
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.run_after)
        .bind(max_queued)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(inserted == 1)
    }

    #[instrument(skip(self, job_types))]
    async fn lease(
        &self,
        lease_owner: &str,
        job_types: &[JobType],
        lease_secs: i64,
    ) -> WorkerResult<Option<LeasedJob>> {
        let types: Vec<String> = job_types.iter().map(|t| t.as_str().to_string()).collect();

        let row: Option<LeaseRow> = sqlx::query_as(
            r#"
            UPDATE job_queue
            SET state = 'running',
                attempts = attempts + 1,
                leased_until = FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT + $3,
                lease_owner = $1,
                updated_at = NOW()
            WHERE job_id = (
                SELECT job_id
                FROM job_queue
                WHERE job_type = ANY($2)
                  AND (
                        (state = 'queued' AND run_after <= FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT)
                     OR (state = 'running'
                         AND leased_until <= FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT
                         AND attempts < max_attempts)
                  )
                ORDER BY run_after, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_id, job_type, payload, attempts, max_attempts,
                      leased_until, lease_owner, cancel_requested
            "#,
        )
        .bind(lease_owner)
        .bind(&types)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LeasedJob::from))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        lease_secs: i64,
    ) -> WorkerResult<Option<Heartbeat>> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            UPDATE job_queue
            SET leased_until = FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT + $3,
                updated_at = NOW()
            WHERE job_id = $1 AND lease_owner = $2 AND state = 'running'
            RETURNING leased_until, cancel_requested
            "#,
        )
        .bind(job_id)
        .bind(lease_owner)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(leased_until, cancel_requested)| Heartbeat {
            leased_until,
            cancel_requested,
        }))
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        state: JobState,
        result: Option<serde_json::Value>,
    ) -> WorkerResult<bool> {
        if !matches!(state, JobState::Succeeded | JobState::Cancelled) {
            return Err(WorkerError::Internal(format!(
                "complete called with non-completion state {}",
                state
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = $3, result = $4, leased_until = NULL, lease_owner = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND lease_owner = $2 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(lease_owner)
        .bind(state.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        error: &str,
        retry_delay_secs: Option<i64>,
    ) -> WorkerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = CASE WHEN $4::BIGINT IS NULL THEN 'failed' ELSE 'queued' END,
                run_after = CASE
                    WHEN $4::BIGINT IS NULL THEN run_after
                    ELSE FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT + $4::BIGINT
                END,
                last_error = $3,
                leased_until = NULL,
                lease_owner = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND lease_owner = $2 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(lease_owner)
        .bind(error)
        .bind(retry_delay_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, job_id: Uuid) -> WorkerResult<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE job_queue
            SET cancel_requested = cancel_requested OR state IN ('queued', 'running'),
                updated_at = NOW()
            WHERE job_id = $1
            RETURNING state
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        state.map(|s| s.parse()).transpose()
    }

    async fn cancel_requested(&self, job_id: Uuid) -> WorkerResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM job_queue WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        progress: serde_json::Value,
    ) -> WorkerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET progress = $3, updated_at = NOW()
            WHERE job_id = $1 AND lease_owner = $2 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(lease_owner)
        .bind(progress)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn fail_exhausted_leases(&self) -> WorkerResult<u64> {
        let failed = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'failed',
                last_error = COALESCE(last_error, 'lease expired on final attempt'),
                leased_until = NULL,
                lease_owner = NULL,
                updated_at = NOW()
            WHERE state = 'running'
              AND leased_until <= FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT
              AND attempts >= max_attempts
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(failed)
    }

    async fn get_job(&self, job_id: Uuid) -> WorkerResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT job_id, job_type, payload, state, attempts, max_attempts, run_after,
                   leased_until, lease_owner, cancel_requested, progress, result,
                   last_error, created_at, updated_at
            FROM job_queue
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn count_by_state(&self) -> WorkerResult<Vec<(JobState, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM job_queue GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(state, count)| Ok((state.parse()?, count)))
            .collect()
    }
}

#[async_trait]
impl ScanStore for PgStore {
    #[instrument(skip(self, run), fields(scan_id = %run.scan_id))]
    async fn create_scan_run(&self, run: NewScanRun) -> WorkerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO scan_runs (scan_id, job_id, user_id, root_path, state)
            VALUES ($1, $2, $3, $4, 'queued')
            "#,
        )
        .bind(&run.scan_id)
        .bind(run.job_id)
        .bind(&run.user_id)
        .bind(&run.root_path)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => Err(
                WorkerError::InvalidJobData(format!(
                    "scan run {} references unknown job {}",
                    run.scan_id, run.job_id
                )),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_scan_run(&self, scan_id: &str) -> WorkerResult<Option<ScanRun>> {
        let row: Option<ScanRunRow> = sqlx::query_as(
            r#"
            SELECT scan_id, job_id, user_id, root_path, state, files_discovered,
                   files_persisted, batches_flushed, errors, last_error, started_at,
                   finished_at, cancelled_at, created_at, updated_at
            FROM scan_runs
            WHERE scan_id = $1
            "#,
        )
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScanRun::try_from).transpose()
    }

    async fn mark_scan_running(&self, scan_id: &str) -> WorkerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE scan_runs
            SET state = 'running', started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE scan_id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(scan_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn update_scan_counters(
        &self,
        scan_id: &str,
        counters: &ScanCounters,
    ) -> WorkerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE scan_runs
            SET files_discovered = $2, files_persisted = $3, batches_flushed = $4,
                errors = $5, updated_at = NOW()
            WHERE scan_id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(scan_id)
        .bind(counters.files_discovered)
        .bind(counters.files_persisted)
        .bind(counters.batches_flushed)
        .bind(counters.errors)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self, counters, last_error))]
    async fn finish_scan_run(
        &self,
        scan_id: &str,
        state: ScanState,
        counters: &ScanCounters,
        last_error: Option<&str>,
    ) -> WorkerResult<bool> {
        if !state.is_terminal() {
            return Err(WorkerError::Internal(format!(
                "finish_scan_run called with non-terminal state {}",
                state
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE scan_runs
            SET state = $2,
                files_discovered = $3, files_persisted = $4, batches_flushed = $5, errors = $6,
                last_error = COALESCE($7, last_error),
                finished_at = NOW(),
                cancelled_at = CASE WHEN $2 = 'cancelled' THEN NOW() ELSE cancelled_at END,
                updated_at = NOW()
            WHERE scan_id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(scan_id)
        .bind(state.as_str())
        .bind(counters.files_discovered)
        .bind(counters.files_persisted)
        .bind(counters.batches_flushed)
        .bind(counters.errors)
        .bind(last_error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn requeue_scan_run(&self, scan_id: &str, last_error: &str) -> WorkerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE scan_runs
            SET state = 'queued', last_error = $2, updated_at = NOW()
            WHERE scan_id = $1 AND state = 'running'
            "#,
        )
        .bind(scan_id)
        .bind(last_error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self, files), fields(count = files.len()))]
    async fn upsert_scan_files(
        &self,
        scan_id: &str,
        files: &[FileDescriptor],
    ) -> WorkerResult<u64> {
        if files.is_empty() {
            return Ok(0);
        }

        // ON CONFLICT cannot touch the same row twice in one statement
        let mut latest = std::collections::BTreeMap::new();
        for file in files {
            latest.insert(file.path.to_string_lossy().to_string(), file);
        }

        let capacity = latest.len();
        let mut ids = Vec::with_capacity(capacity);
        let mut paths = Vec::with_capacity(capacity);
        let mut sizes = Vec::with_capacity(capacity);
        let mut mtimes = Vec::with_capacity(capacity);
        let mut extensions = Vec::with_capacity(capacity);
        for (path, file) in latest {
            ids.push(Uuid::new_v4());
            paths.push(path);
            sizes.push(file.size_bytes as i64);
            mtimes.push(file.mtime_ms);
            extensions.push(file.extension.clone());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO scan_files (scan_file_id, scan_id, path, size_bytes, mtime_ms, extension)
            SELECT id, $2, path, size_bytes, mtime_ms, extension
            FROM UNNEST($1::UUID[], $3::TEXT[], $4::BIGINT[], $5::BIGINT[], $6::TEXT[])
                AS t(id, path, size_bytes, mtime_ms, extension)
            ON CONFLICT (scan_id, path) DO UPDATE
            SET size_bytes = EXCLUDED.size_bytes,
                mtime_ms = EXCLUDED.mtime_ms,
                extension = EXCLUDED.extension,
                updated_at = NOW()
            "#,
        )
        .bind(&ids)
        .bind(scan_id)
        .bind(&paths)
        .bind(&sizes)
        .bind(&mtimes)
        .bind(&extensions)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(WorkerError::ScanRunNotFound(scan_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_scan_files(&self, scan_id: &str) -> WorkerResult<Vec<ScanFile>> {
        let rows: Vec<ScanFileRow> = sqlx::query_as(
            r#"
            SELECT scan_file_id, scan_id, path, size_bytes, mtime_ms, extension
            FROM scan_files
            WHERE scan_id = $1
            ORDER BY path
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ScanFile::from).collect())
    }
}
