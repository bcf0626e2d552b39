//! Persistence layer for job records, scan runs and discovered files
//!
//! All mutation goes through conditional updates: a write that expects a
//! particular state or lease owner and finds something else changes nothing
//! and reports `false`/`None` instead of failing. Workers never hold a job
//! record in memory as the source of truth, only the lease claim.
//!
//! Two implementations are provided:
//! - [`PgStore`] - PostgreSQL via sqlx, used in production
//! - [`MemoryStore`] - mutex-guarded maps with identical semantics, used by
//!   tests and local development

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::WorkerResult;
use crate::queue::{Heartbeat, Job, JobState, JobType, LeasedJob, NewJob};
use crate::scan::{FileDescriptor, NewScanRun, ScanCounters, ScanFile, ScanRun, ScanState};

/// Durable job records (`job_queue`)
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` as `queued` unless `max_queued` queued jobs already exist.
    /// Returns whether the row was inserted.
    async fn insert_job_bounded(&self, job: NewJob, max_queued: i64) -> WorkerResult<bool>;

    /// Atomically claim the oldest leasable job among `job_types`: state becomes
    /// `running`, `attempts` increments and the lease is recorded.
    async fn lease(
        &self,
        lease_owner: &str,
        job_types: &[JobType],
        lease_secs: i64,
    ) -> WorkerResult<Option<LeasedJob>>;

    /// Extend the lease if `lease_owner` still holds it on a running job
    async fn heartbeat(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        lease_secs: i64,
    ) -> WorkerResult<Option<Heartbeat>>;

    /// Terminal transition (`succeeded` or `cancelled`) for a held lease
    async fn complete(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        state: JobState,
        result: Option<serde_json::Value>,
    ) -> WorkerResult<bool>;

    /// Record a failure for a held lease: requeue after `retry_delay_secs`,
    /// or mark `failed` when it is `None`
    async fn fail(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        error: &str,
        retry_delay_secs: Option<i64>,
    ) -> WorkerResult<bool>;

    /// Set `cancel_requested` on a queued or running job. Returns the job's
    /// current state, or `None` if it does not exist.
    async fn request_cancel(&self, job_id: Uuid) -> WorkerResult<Option<JobState>>;

    async fn cancel_requested(&self, job_id: Uuid) -> WorkerResult<bool>;

    /// Store a handler progress snapshot for a held lease
    async fn update_progress(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        progress: serde_json::Value,
    ) -> WorkerResult<bool>;

    /// Fail running jobs whose lease expired with no attempts left
    async fn fail_exhausted_leases(&self) -> WorkerResult<u64>;

    async fn get_job(&self, job_id: Uuid) -> WorkerResult<Option<Job>>;

    async fn count_by_state(&self) -> WorkerResult<Vec<(JobState, i64)>>;
}

/// Scan runs (`scan_runs`) and the file index (`scan_files`)
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn create_scan_run(&self, run: NewScanRun) -> WorkerResult<()>;

    async fn get_scan_run(&self, scan_id: &str) -> WorkerResult<Option<ScanRun>>;

    /// `queued`/`running` to `running`; keeps the first `started_at`
    async fn mark_scan_running(&self, scan_id: &str) -> WorkerResult<bool>;

    /// Overwrite counters on a non-terminal run
    async fn update_scan_counters(&self, scan_id: &str, counters: &ScanCounters)
        -> WorkerResult<bool>;

    /// Finalize a non-terminal run. Only the first call wins.
    async fn finish_scan_run(
        &self,
        scan_id: &str,
        state: ScanState,
        counters: &ScanCounters,
        last_error: Option<&str>,
    ) -> WorkerResult<bool>;

    /// `running` back to `queued` after a retryable failure
    async fn requeue_scan_run(&self, scan_id: &str, last_error: &str) -> WorkerResult<bool>;

    /// Insert-or-update keyed by `(scan_id, path)`. Returns the number of
    /// descriptors written.
    async fn upsert_scan_files(&self, scan_id: &str, files: &[FileDescriptor])
        -> WorkerResult<u64>;

    /// Files of a run ordered by path
    async fn list_scan_files(&self, scan_id: &str) -> WorkerResult<Vec<ScanFile>>;
}
