//! Test fixtures for worker integration tests
//!
//! Provides an in-memory [`Harness`] and payload builders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use resonance_shared_config::QueueConfig;
use resonance_worker::queue::{EnqueueOptions, SchemaRegistry};
use resonance_worker::scan::{NewScanRun, ScanDirectoryHandler};
use resonance_worker::store::{MemoryStore, ScanStore};
use resonance_worker::{InflightLimiter, JobQueueService, JobType, ScanConfig, WorkerLoop};
use serde_json::json;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Queue config with short leases and the given length ceiling
pub fn queue_config(max_length: i64) -> QueueConfig {
    QueueConfig {
        max_length,
        lease_duration_secs: 30,
        poll_interval_ms: 20,
        ..QueueConfig::default()
    }
}

/// Queue, limiter and a worker running the scan handler over one `MemoryStore`
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: JobQueueService,
    pub worker: WorkerLoop,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(queue_config(100), ScanConfig::default())
    }

    pub fn with_config(queue: QueueConfig, scan: ScanConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_scan_store(store.clone(), store, queue, scan)
    }

    /// Scan handler persisting through `scans` instead of the memory store
    pub fn with_scan_store(
        store: Arc<MemoryStore>,
        scans: Arc<dyn ScanStore>,
        queue_config: QueueConfig,
        scan: ScanConfig,
    ) -> Self {
        let queue = JobQueueService::new(store.clone(), queue_config, SchemaRegistry::with_defaults());
        let limiter = Arc::new(InflightLimiter::new(4, HashMap::new()));
        let mut worker = WorkerLoop::new("worker-test", queue.clone(), limiter);
        worker.register(Arc::new(ScanDirectoryHandler::new(scans, scan)));
        Self {
            store,
            queue,
            worker,
        }
    }

    /// One poll pass, then wait for every dispatched job to finish
    pub async fn run_pending(&self) -> usize {
        let mut tasks = JoinSet::new();
        let dispatched = self
            .worker
            .poll_once(&mut tasks)
            .await
            .expect("poll failed");
        while let Some(joined) = tasks.join_next().await {
            joined.expect("job task panicked");
        }
        dispatched
    }

    /// Enqueue a scan job with an explicit payload and create its run
    pub async fn enqueue_raw_scan(
        &self,
        root_path: &str,
        allowed_roots: &[&str],
        options: serde_json::Value,
    ) -> (String, Uuid) {
        let scan_id = format!("scan_{}", Uuid::new_v4().simple());
        let payload = scan_payload(&scan_id, root_path, allowed_roots, options);
        let job_id = self
            .queue
            .enqueue(&JobType::SCAN_DIRECTORY, payload, EnqueueOptions::default())
            .await
            .expect("enqueue failed")
            .job_id()
            .expect("queue unexpectedly full");
        self.store
            .create_scan_run(NewScanRun {
                scan_id: scan_id.clone(),
                job_id,
                user_id: "user-test".to_string(),
                root_path: root_path.to_string(),
            })
            .await
            .expect("create scan run failed");
        (scan_id, job_id)
    }
}

/// A `scan.directory` payload
pub fn scan_payload(
    scan_id: &str,
    root_path: &str,
    allowed_roots: &[&str],
    options: serde_json::Value,
) -> serde_json::Value {
    json!({
        "scanId": scan_id,
        "userId": "user-test",
        "rootPath": root_path,
        "allowedRoots": allowed_roots,
        "options": options,
    })
}

pub fn path_str(path: &Path) -> String {
    path.display().to_string()
}
