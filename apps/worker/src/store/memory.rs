//! In-process store with the same conditional-update semantics as Postgres
//!
//! Every operation takes the single mutex for its whole read-modify-write,
//! which gives the same atomicity the SQL statements get from row locks.
//!
//! # Clock
//!
//! Epoch-second timestamps come from the system clock plus an adjustable
//! offset ([`MemoryStore::advance_clock`]), so tests can step over backoff
//! delays and lease expiries without sleeping.
//!
//! # Lock Poisoning Recovery
//!
//! Locks are acquired with `unwrap_or_else(|e| e.into_inner())` so a panic in
//! one test does not cascade into `PoisonError`s elsewhere.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{JobStore, ScanStore};
use crate::error::{WorkerError, WorkerResult};
use crate::queue::{Heartbeat, Job, JobState, JobType, LeasedJob, NewJob};
use crate::scan::{FileDescriptor, NewScanRun, ScanCounters, ScanFile, ScanRun, ScanState};

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as creation order
    jobs: Vec<Job>,
    runs: HashMap<String, ScanRun>,
    files: HashMap<String, BTreeMap<String, ScanFile>>,
}

impl Inner {
    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.job_id == job_id)
    }

    /// Running job still held by `lease_owner`
    fn held_mut(&mut self, job_id: Uuid, lease_owner: &str) -> Option<&mut Job> {
        self.job_mut(job_id).filter(|job| {
            job.state == JobState::Running && job.lease_owner.as_deref() == Some(lease_owner)
        })
    }
}

/// Mutex-guarded in-memory implementation of [`JobStore`] and [`ScanStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock_offset: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store time in epoch seconds
    pub fn now(&self) -> i64 {
        Utc::now().timestamp() + self.clock_offset.load(Ordering::SeqCst)
    }

    /// Move the store clock forward
    pub fn advance_clock(&self, secs: i64) {
        self.clock_offset.fetch_add(secs, Ordering::SeqCst);
    }

    /// Insert a bare queued job for tests that only need a valid `job_id`
    #[cfg(test)]
    pub(crate) async fn seed_job(&self) -> Uuid {
        let job = NewJob {
            job_id: Uuid::new_v4(),
            job_type: JobType::from("test.seed"),
            payload: serde_json::json!({}),
            max_attempts: 1,
            run_after: None,
        };
        let job_id = job.job_id;
        self.insert_job_bounded(job, i64::MAX)
            .await
            .expect("seed job insert failed");
        job_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn clear_lease(job: &mut Job) {
    job.leased_until = None;
    job.lease_owner = None;
    job.updated_at = Utc::now();
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job_bounded(&self, job: NewJob, max_queued: i64) -> WorkerResult<bool> {
        let now = self.now();
        let mut inner = self.lock();

        let queued = inner
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Queued)
            .count() as i64;
        if queued >= max_queued {
            return Ok(false);
        }
        if inner.jobs.iter().any(|j| j.job_id == job.job_id) {
            return Err(WorkerError::InvalidJobData(format!(
                "duplicate job id {}",
                job.job_id
            )));
        }

        let created = Utc::now();
        inner.jobs.push(Job {
            job_id: job.job_id,
            job_type: job.job_type,
            payload: job.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: job.max_attempts,
            run_after: job.run_after.unwrap_or(now),
            leased_until: None,
            lease_owner: None,
            cancel_requested: false,
            progress: None,
            result: None,
            last_error: None,
            created_at: created,
            updated_at: created,
        });
        Ok(true)
    }

    async fn lease(
        &self,
        lease_owner: &str,
        job_types: &[JobType],
        lease_secs: i64,
    ) -> WorkerResult<Option<LeasedJob>> {
        let now = self.now();
        let mut inner = self.lock();

        let candidate = inner
            .jobs
            .iter_mut()
            .enumerate()
            .filter(|(_, job)| {
                job_types.contains(&job.job_type)
                    && job.is_leasable(now)
                    && (job.state == JobState::Queued || job.attempts < job.max_attempts)
            })
            .min_by_key(|(index, job)| (job.run_after, *index))
            .map(|(_, job)| job);

        let Some(job) = candidate else {
            return Ok(None);
        };

        job.state = JobState::Running;
        job.attempts += 1;
        job.leased_until = Some(now + lease_secs);
        job.lease_owner = Some(lease_owner.to_string());
        job.updated_at = Utc::now();

        Ok(Some(LeasedJob {
            job_id: job.job_id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            leased_until: now + lease_secs,
            lease_owner: lease_owner.to_string(),
            cancel_requested: job.cancel_requested,
        }))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        lease_secs: i64,
    ) -> WorkerResult<Option<Heartbeat>> {
        let now = self.now();
        let mut inner = self.lock();
        Ok(inner.held_mut(job_id, lease_owner).map(|job| {
            job.leased_until = Some(now + lease_secs);
            job.updated_at = Utc::now();
            Heartbeat {
                leased_until: now + lease_secs,
                cancel_requested: job.cancel_requested,
            }
        }))
    }

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
        let mut inner = self.lock();
        Ok(match inner.held_mut(job_id, lease_owner) {
            Some(job) => {
                job.state = state;
                job.result = result;
                clear_lease(job);
                true
            }
            None => false,
        })
    }

    async fn fail(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        error: &str,
        retry_delay_secs: Option<i64>,
    ) -> WorkerResult<bool> {
        let now = self.now();
        let mut inner = self.lock();
        Ok(match inner.held_mut(job_id, lease_owner) {
            Some(job) => {
                match retry_delay_secs {
                    Some(delay) => {
                        job.state = JobState::Queued;
                        job.run_after = now + delay;
                    }
                    None => job.state = JobState::Failed,
                }
                job.last_error = Some(error.to_string());
                clear_lease(job);
                true
            }
            None => false,
        })
    }

    async fn request_cancel(&self, job_id: Uuid) -> WorkerResult<Option<JobState>> {
        let mut inner = self.lock();
        Ok(inner.job_mut(job_id).map(|job| {
            if matches!(job.state, JobState::Queued | JobState::Running) {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
            }
            job.state
        }))
    }

    async fn cancel_requested(&self, job_id: Uuid) -> WorkerResult<bool> {
        let mut inner = self.lock();
        Ok(inner
            .job_mut(job_id)
            .map(|job| job.cancel_requested)
            .unwrap_or(false))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        progress: serde_json::Value,
    ) -> WorkerResult<bool> {
        let mut inner = self.lock();
        Ok(match inner.held_mut(job_id, lease_owner) {
            Some(job) => {
                job.progress = Some(progress);
                job.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn fail_exhausted_leases(&self) -> WorkerResult<u64> {
        let now = self.now();
        let mut inner = self.lock();
        let mut failed = 0;
        for job in inner.jobs.iter_mut().filter(|job| {
            job.state == JobState::Running
                && job.leased_until.map_or(true, |until| until <= now)
                && job.attempts >= job.max_attempts
        }) {
            job.state = JobState::Failed;
            job.last_error
                .get_or_insert_with(|| "lease expired on final attempt".to_string());
            clear_lease(job);
            failed += 1;
        }
        Ok(failed)
    }

    async fn get_job(&self, job_id: Uuid) -> WorkerResult<Option<Job>> {
        let mut inner = self.lock();
        Ok(inner.job_mut(job_id).map(|job| job.clone()))
    }

    async fn count_by_state(&self) -> WorkerResult<Vec<(JobState, i64)>> {
        let inner = self.lock();
        Ok(JobState::ALL
            .iter()
            .map(|state| {
                let count = inner.jobs.iter().filter(|j| j.state == *state).count() as i64;
                (*state, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_scan_run(&self, run: NewScanRun) -> WorkerResult<()> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.scan_id) {
            return Err(WorkerError::InvalidJobData(format!(
                "scan run {} already exists",
                run.scan_id
            )));
        }
        if !inner.jobs.iter().any(|job| job.job_id == run.job_id) {
            return Err(WorkerError::InvalidJobData(format!(
                "scan run {} references unknown job {}",
                run.scan_id, run.job_id
            )));
        }
        let created = Utc::now();
        inner.runs.insert(
            run.scan_id.clone(),
            ScanRun {
                scan_id: run.scan_id,
                job_id: run.job_id,
                user_id: run.user_id,
                root_path: run.root_path,
                state: ScanState::Queued,
                counters: ScanCounters::default(),
                last_error: None,
                started_at: None,
                finished_at: None,
                cancelled_at: None,
                created_at: created,
                updated_at: created,
            },
        );
        Ok(())
    }

    async fn get_scan_run(&self, scan_id: &str) -> WorkerResult<Option<ScanRun>> {
        Ok(self.lock().runs.get(scan_id).cloned())
    }

    async fn mark_scan_running(&self, scan_id: &str) -> WorkerResult<bool> {
        let mut inner = self.lock();
        Ok(match inner.runs.get_mut(scan_id) {
            Some(run) if !run.state.is_terminal() => {
                let now = Utc::now();
                run.state = ScanState::Running;
                run.started_at.get_or_insert(now);
                run.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn update_scan_counters(
        &self,
        scan_id: &str,
        counters: &ScanCounters,
    ) -> WorkerResult<bool> {
        let mut inner = self.lock();
        Ok(match inner.runs.get_mut(scan_id) {
            Some(run) if !run.state.is_terminal() => {
                run.counters = *counters;
                run.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

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
        let mut inner = self.lock();
        Ok(match inner.runs.get_mut(scan_id) {
            Some(run) if !run.state.is_terminal() => {
                let now = Utc::now();
                run.state = state;
                run.counters = *counters;
                if let Some(error) = last_error {
                    run.last_error = Some(error.to_string());
                }
                run.finished_at = Some(now);
                if state == ScanState::Cancelled {
                    run.cancelled_at = Some(now);
                }
                run.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn requeue_scan_run(&self, scan_id: &str, last_error: &str) -> WorkerResult<bool> {
        let mut inner = self.lock();
        Ok(match inner.runs.get_mut(scan_id) {
            Some(run) if run.state == ScanState::Running => {
                run.state = ScanState::Queued;
                run.last_error = Some(last_error.to_string());
                run.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn upsert_scan_files(
        &self,
        scan_id: &str,
        files: &[FileDescriptor],
    ) -> WorkerResult<u64> {
        let mut inner = self.lock();
        if !inner.runs.contains_key(scan_id) {
            return Err(WorkerError::ScanRunNotFound(scan_id.to_string()));
        }
        let index = inner.files.entry(scan_id.to_string()).or_default();
        let mut written = BTreeSet::new();
        for file in files {
            let path = file.path.to_string_lossy().to_string();
            written.insert(path.clone());
            let scan_file_id = index
                .get(&path)
                .map(|existing| existing.scan_file_id)
                .unwrap_or_else(Uuid::new_v4);
            index.insert(
                path.clone(),
                ScanFile {
                    scan_file_id,
                    scan_id: scan_id.to_string(),
                    path,
                    size_bytes: file.size_bytes as i64,
                    mtime_ms: file.mtime_ms,
                    extension: file.extension.clone(),
                },
            );
        }
        Ok(written.len() as u64)
    }

    async fn list_scan_files(&self, scan_id: &str) -> WorkerResult<Vec<ScanFile>> {
        Ok(self
            .lock()
            .files
            .get(scan_id)
            .map(|index| index.values().cloned().collect())
            .unwrap_or_default())
    }
}
