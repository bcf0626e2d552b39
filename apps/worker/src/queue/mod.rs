//! Durable job queue
//!
//! [`JobQueueService`] is the control-plane API over a [`JobStore`]:
//! enqueue with schema validation and backpressure, lease, heartbeat,
//! terminal transitions with capped exponential backoff, and cooperative
//! cancellation requests.

mod job;
mod schema;

pub use job::{
    EnqueueOptions, EnqueueOutcome, FailureDisposition, Heartbeat, Job, JobState, JobType,
    LeasedJob, NewJob, QueueStats,
};
pub use schema::{PayloadValidator, ScanDirectoryPayload, ScanOptions, SchemaRegistry};

use std::sync::Arc;

use resonance_shared_config::QueueConfig;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};
use crate::store::JobStore;

/// Retry delay after `attempts` failed attempts: `min(2^attempts, cap)` seconds
pub fn backoff_delay_secs(attempts: i32, cap_secs: i64) -> i64 {
    let exponent = attempts.max(0) as u32;
    2_i64
        .checked_pow(exponent)
        .unwrap_or(i64::MAX)
        .min(cap_secs.max(0))
}

/// Enqueue, lease and lifecycle operations over the job store
#[derive(Clone)]
pub struct JobQueueService {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    schemas: Arc<SchemaRegistry>,
}

impl JobQueueService {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig, schemas: SchemaRegistry) -> Self {
        Self {
            store,
            config,
            schemas: Arc::new(schemas),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Validate and persist a new job.
    ///
    /// A full queue is reported as [`EnqueueOutcome::QueueFull`], not as an error.
    pub async fn enqueue(
        &self,
        job_type: &JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> WorkerResult<EnqueueOutcome> {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts < 1 {
            return Err(WorkerError::InvalidJobData(format!(
                "maxAttempts must be at least 1, got {}",
                max_attempts
            )));
        }
        self.schemas.validate(job_type, &payload)?;

        let job_id = Uuid::new_v4();
        let inserted = self
            .store
            .insert_job_bounded(
                NewJob {
                    job_id,
                    job_type: job_type.clone(),
                    payload,
                    max_attempts,
                    run_after: options.run_after,
                },
                self.config.max_length,
            )
            .await?;

        if !inserted {
            tracing::warn!(
                job_type = %job_type,
                max_length = self.config.max_length,
                "Queue full, job rejected"
            );
            return Ok(EnqueueOutcome::QueueFull);
        }

        tracing::debug!(job_id = %job_id, job_type = %job_type, max_attempts, "Job enqueued");
        Ok(EnqueueOutcome::Queued { job_id })
    }

    /// Claim the oldest leasable job among `job_types`
    pub async fn lease(
        &self,
        lease_owner: &str,
        job_types: &[JobType],
    ) -> WorkerResult<Option<LeasedJob>> {
        if job_types.is_empty() {
            return Ok(None);
        }
        let leased = self
            .store
            .lease(lease_owner, job_types, self.config.lease_duration_secs)
            .await?;
        if let Some(job) = &leased {
            tracing::debug!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                lease_owner,
                "Job leased"
            );
        }
        Ok(leased)
    }

    /// Extend a held lease. `None` means the lease is gone.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        lease_owner: &str,
    ) -> WorkerResult<Option<Heartbeat>> {
        let beat = self
            .store
            .heartbeat(job_id, lease_owner, self.config.lease_duration_secs)
            .await?;
        if beat.is_none() {
            tracing::warn!(job_id = %job_id, lease_owner, "Heartbeat rejected, lease lost");
        }
        Ok(beat)
    }

    /// Returns false if the lease was lost and nothing was written
    pub async fn mark_succeeded(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        result: serde_json::Value,
    ) -> WorkerResult<bool> {
        self.complete(job_id, lease_owner, JobState::Succeeded, result)
            .await
    }

    pub async fn mark_cancelled(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        result: serde_json::Value,
    ) -> WorkerResult<bool> {
        self.complete(job_id, lease_owner, JobState::Cancelled, result)
            .await
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        state: JobState,
        result: serde_json::Value,
    ) -> WorkerResult<bool> {
        let written = self
            .store
            .complete(job_id, lease_owner, state, Some(result))
            .await?;
        if written {
            tracing::info!(job_id = %job_id, state = %state, "Job completed");
        } else {
            tracing::warn!(job_id = %job_id, state = %state, lease_owner, "Completion ignored, lease lost");
        }
        Ok(written)
    }

    /// Requeue with backoff while attempts remain, otherwise fail terminally
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        error: &str,
        attempts: i32,
        max_attempts: i32,
    ) -> WorkerResult<FailureDisposition> {
        let delay = (attempts < max_attempts)
            .then(|| backoff_delay_secs(attempts, self.config.backoff_cap_secs));

        if !self.store.fail(job_id, lease_owner, error, delay).await? {
            tracing::warn!(job_id = %job_id, lease_owner, "Failure ignored, lease lost");
            return Ok(FailureDisposition::LeaseLost);
        }

        Ok(match delay {
            Some(delay_secs) => {
                tracing::warn!(
                    job_id = %job_id,
                    attempt = attempts,
                    max_attempts,
                    delay_secs,
                    error,
                    "Job failed, retry scheduled"
                );
                FailureDisposition::Retry { delay_secs }
            }
            None => {
                tracing::error!(
                    job_id = %job_id,
                    attempts,
                    error,
                    "Job failed permanently"
                );
                FailureDisposition::Failed
            }
        })
    }

    /// Flag a queued or running job for cancellation and report its state
    pub async fn request_cancel(&self, job_id: Uuid) -> WorkerResult<Option<JobState>> {
        let state = self.store.request_cancel(job_id).await?;
        tracing::info!(job_id = %job_id, state = ?state, "Cancellation requested");
        Ok(state)
    }

    pub async fn is_cancel_requested(&self, job_id: Uuid) -> WorkerResult<bool> {
        self.store.cancel_requested(job_id).await
    }

    pub async fn update_progress(
        &self,
        job_id: Uuid,
        lease_owner: &str,
        progress: serde_json::Value,
    ) -> WorkerResult<bool> {
        self.store
            .update_progress(job_id, lease_owner, progress)
            .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> WorkerResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn stats(&self) -> WorkerResult<QueueStats> {
        let mut stats = QueueStats::default();
        for (state, count) in self.store.count_by_state().await? {
            stats.add(state, count);
        }
        Ok(stats)
    }

    /// Fail jobs whose holder vanished during their final attempt
    pub async fn reap_exhausted_leases(&self) -> WorkerResult<u64> {
        let failed = self.store.fail_exhausted_leases().await?;
        if failed > 0 {
            tracing::warn!(failed, "Failed jobs whose final lease expired");
        }
        Ok(failed)
    }
}

impl std::fmt::Debug for JobQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueService")
            .field("config", &self.config)
            .field("schemas", &self.schemas)
            .finish_non_exhaustive()
    }
}
