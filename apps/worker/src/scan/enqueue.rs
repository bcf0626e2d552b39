//! Enqueue side of a directory scan
//!
//! Creating a scan is two writes: the `scan.directory` job, then the
//! `queued` scan run that references it. A worker that leases the job before
//! the run row lands sees a retryable "scan run not found" and retries.

use uuid::Uuid;

use super::model::NewScanRun;
use crate::error::WorkerResult;
use crate::queue::{
    EnqueueOptions, EnqueueOutcome, JobQueueService, JobType, ScanDirectoryPayload, ScanOptions,
};
use crate::store::ScanStore;

/// Result of [`enqueue_scan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEnqueueOutcome {
    Queued { scan_id: String, job_id: Uuid },
    /// Backpressure; nothing was written
    QueueFull,
}

impl ScanEnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// Machine-readable rejection reason
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Queued { .. } => None,
            Self::QueueFull => EnqueueOutcome::QueueFull.reason(),
        }
    }
}

pub fn new_scan_id() -> String {
    format!("scan_{}", Uuid::new_v4().simple())
}

/// Enqueue a scan of `root_path` confined to itself and record its scan run
pub async fn enqueue_scan(
    queue: &JobQueueService,
    scans: &dyn ScanStore,
    user_id: &str,
    root_path: &str,
    options: ScanOptions,
) -> WorkerResult<ScanEnqueueOutcome> {
    let scan_id = new_scan_id();
    let payload = ScanDirectoryPayload {
        scan_id: scan_id.clone(),
        user_id: user_id.to_string(),
        root_path: root_path.to_string(),
        allowed_roots: vec![root_path.to_string()],
        options,
    };

    let outcome = queue
        .enqueue(
            &JobType::SCAN_DIRECTORY,
            serde_json::to_value(&payload)?,
            EnqueueOptions::default(),
        )
        .await?;

    let job_id = match outcome {
        EnqueueOutcome::Queued { job_id } => job_id,
        EnqueueOutcome::QueueFull => return Ok(ScanEnqueueOutcome::QueueFull),
    };

    scans
        .create_scan_run(NewScanRun {
            scan_id: scan_id.clone(),
            job_id,
            user_id: payload.user_id,
            root_path: payload.root_path,
        })
        .await?;

    tracing::info!(scan_id = %scan_id, job_id = %job_id, user_id, root_path, "Scan enqueued");
    Ok(ScanEnqueueOutcome::Queued { scan_id, job_id })
}
