//! Polling worker loop
//!
//! Each pass walks the registered job types, and for every type with free
//! capacity in the [`InflightLimiter`] tries to lease one job. Leased jobs run
//! on their own task alongside a heartbeat that keeps the lease alive and
//! feeds cancellation requests into the job's [`JobContext`]. When a pass
//! dispatches nothing the loop sleeps for the poll interval.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};
use crate::limiter::{InflightLimiter, InflightPermit};
use crate::queue::{JobQueueService, JobType, LeasedJob};

/// How a handler finished, with the result stored on the job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(serde_json::Value),
    /// Stopped early after a cancellation request
    Cancelled(serde_json::Value),
}

/// Executes jobs of one type
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run one leased job. Errors are routed to the retry policy by the loop.
    async fn run(&self, ctx: &JobContext) -> WorkerResult<JobOutcome>;
}

/// Per-job handle given to a handler
pub struct JobContext {
    job: LeasedJob,
    cancel: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
    queue: JobQueueService,
}

impl JobContext {
    pub fn new(job: LeasedJob, queue: JobQueueService) -> Self {
        let cancel = Arc::new(AtomicBool::new(job.cancel_requested));
        Self {
            job,
            cancel,
            lease_lost: Arc::new(AtomicBool::new(false)),
            queue,
        }
    }

    pub fn job(&self) -> &LeasedJob {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.job_id
    }

    /// Last observed cancellation state; does not touch the store
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Shared flag, set by the heartbeat and by [`JobContext::refresh_cancel`]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Another worker holds the job now. Not a cancellation: the handler
    /// must stop without writing anything the new holder owns.
    pub fn is_lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Shared flag, set by the heartbeat and by lease-guarded writes that miss
    pub fn lease_lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lease_lost)
    }

    /// Error to return once [`JobContext::is_lease_lost`] is observed
    pub fn lease_lost_error(&self) -> WorkerError {
        WorkerError::LeaseLost(self.job.job_id)
    }

    /// Re-read the cancellation flag from the store
    pub async fn refresh_cancel(&self) -> WorkerResult<bool> {
        if self.queue.is_cancel_requested(self.job.job_id).await? {
            self.cancel.store(true, Ordering::SeqCst);
        }
        Ok(self.is_cancel_requested())
    }

    /// Extend the lease now. Returns whether it is still held.
    pub async fn confirm_lease(&self) -> WorkerResult<bool> {
        if self.is_lease_lost() {
            return Ok(false);
        }
        match self
            .queue
            .heartbeat(self.job.job_id, &self.job.lease_owner)
            .await?
        {
            Some(beat) => {
                if beat.cancel_requested {
                    self.cancel.store(true, Ordering::SeqCst);
                }
                Ok(true)
            }
            None => {
                self.lease_lost.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    /// Store a progress snapshot. A miss means the lease is gone.
    pub async fn report_progress(&self, progress: serde_json::Value) -> WorkerResult<bool> {
        let held = self
            .queue
            .update_progress(self.job.job_id, &self.job.lease_owner, progress)
            .await?;
        if !held {
            self.lease_lost.store(true, Ordering::SeqCst);
        }
        Ok(held)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.job_id)
            .field("job_type", &self.job.job_type)
            .field("cancel_requested", &self.is_cancel_requested())
            .field("lease_lost", &self.is_lease_lost())
            .finish()
    }
}

/// Lease-and-dispatch loop of one worker process
pub struct WorkerLoop {
    worker_id: String,
    queue: JobQueueService,
    limiter: Arc<InflightLimiter>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    /// Registration order; lease attempts follow it
    job_types: Vec<JobType>,
}

impl WorkerLoop {
    pub fn new(
        worker_id: impl Into<String>,
        queue: JobQueueService,
        limiter: Arc<InflightLimiter>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            limiter,
            handlers: HashMap::new(),
            job_types: Vec::new(),
        }
    }

    /// Register a handler; a later handler for the same type replaces it
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type.clone(), handler).is_none() {
            self.job_types.push(job_type);
        }
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn job_types(&self) -> &[JobType] {
        &self.job_types
    }

    /// Poll until `shutdown` fires, then wait for in-flight jobs to finish
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll_interval = Duration::from_millis(self.queue.config().poll_interval_ms);
        let mut tasks = JoinSet::new();

        tracing::info!(
            worker_id = %self.worker_id,
            job_types = ?self.job_types,
            global_cap = self.limiter.global_cap(),
            "Worker loop started"
        );

        while !shutdown.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                log_join_result(joined);
            }

            let dispatched = match self.poll_once(&mut tasks).await {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    err.log();
                    0
                }
            };
            if dispatched > 0 {
                continue;
            }

            if let Err(err) = self.queue.reap_exhausted_leases().await {
                err.log();
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join_result(joined),
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            inflight = tasks.len(),
            "Worker loop stopping, draining in-flight jobs"
        );
        while let Some(joined) = tasks.join_next().await {
            log_join_result(joined);
        }
        tracing::info!(worker_id = %self.worker_id, "Worker loop stopped");
    }

    /// One pass over the registered types. Returns the number of jobs dispatched.
    pub async fn poll_once(&self, tasks: &mut JoinSet<()>) -> WorkerResult<usize> {
        let mut dispatched = 0;

        for job_type in &self.job_types {
            let Some(permit) = self.limiter.try_acquire(job_type) else {
                continue;
            };
            let Some(job) = self
                .queue
                .lease(&self.worker_id, std::slice::from_ref(job_type))
                .await?
            else {
                continue;
            };
            let Some(handler) = self.handlers.get(job_type).cloned() else {
                return Err(WorkerError::UnknownJobType(job_type.to_string()));
            };

            let span = tracing::info_span!(
                "job",
                job_id = %job.job_id,
                job_type = %job.job_type,
                attempt = job.attempts
            );
            tasks.spawn(execute_job(self.queue.clone(), handler, job, permit).instrument(span));
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

impl std::fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("worker_id", &self.worker_id)
            .field("job_types", &self.job_types)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

fn log_join_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        WorkerError::from(err).log();
    }
}

/// Run a leased job to a terminal write. Holds the limiter slot throughout.
async fn execute_job(
    queue: JobQueueService,
    handler: Arc<dyn JobHandler>,
    job: LeasedJob,
    _permit: InflightPermit,
) {
    let job_id = job.job_id;
    let lease_owner = job.lease_owner.clone();
    let attempts = job.attempts;
    let max_attempts = job.max_attempts;

    let ctx = JobContext::new(job, queue.clone());
    let heartbeat = spawn_heartbeat(
        queue.clone(),
        job_id,
        lease_owner.clone(),
        ctx.cancel_flag(),
        ctx.lease_lost_flag(),
    );

    tracing::info!("Job started");
    let outcome = AssertUnwindSafe(handler.run(&ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(WorkerError::Internal(panic_message(panic.as_ref()))));

    heartbeat.abort();

    let written = match outcome {
        Ok(JobOutcome::Succeeded(result)) => queue
            .mark_succeeded(job_id, &lease_owner, result)
            .await
            .map(|_| ()),
        Ok(JobOutcome::Cancelled(result)) => queue
            .mark_cancelled(job_id, &lease_owner, result)
            .await
            .map(|_| ()),
        Err(WorkerError::LeaseLost(_)) => {
            tracing::warn!("Lease lost; leaving the job to its current holder");
            Ok(())
        }
        Err(err) => {
            err.log();
            // Non-retryable errors use up the remaining attempts
            let ceiling = if err.is_retryable() {
                max_attempts
            } else {
                attempts
            };
            queue
                .mark_failed(job_id, &lease_owner, &err.to_string(), attempts, ceiling)
                .await
                .map(|_| ())
        }
    };

    if let Err(err) = written {
        err.log();
    }
}

/// Extend the lease every third of its duration until aborted or lost.
/// Cancellation requests and lease loss are published on separate flags.
fn spawn_heartbeat(
    queue: JobQueueService,
    job_id: Uuid,
    lease_owner: String,
    cancel: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = Duration::from_secs(queue.config().heartbeat_interval_secs());

    tokio::spawn(
        async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match queue.heartbeat(job_id, &lease_owner).await {
                    Ok(Some(beat)) => {
                        if beat.cancel_requested && !cancel.swap(true, Ordering::SeqCst) {
                            tracing::info!("Cancellation observed by heartbeat");
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("Heartbeat rejected, lease lost");
                        lease_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => err.log(),
                }
            }
        }
        .in_current_span(),
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("job handler panicked: {}", detail)
}
