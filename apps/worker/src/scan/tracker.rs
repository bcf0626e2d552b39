//! Scan run progress and finalization

use std::sync::Arc;

use super::model::{ScanCounters, ScanState, ScanSummary};
use crate::error::{WorkerError, WorkerResult};
use crate::store::ScanStore;

/// Tracks counters for one scan run and mirrors them into `scan_runs`
pub struct ScanRunTracker {
    store: Arc<dyn ScanStore>,
    scan_id: String,
    counters: ScanCounters,
}

impl ScanRunTracker {
    pub fn new(store: Arc<dyn ScanStore>, scan_id: impl Into<String>) -> Self {
        Self {
            store,
            scan_id: scan_id.into(),
            counters: ScanCounters::default(),
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn counters(&self) -> ScanCounters {
        self.counters
    }

    /// Transition the run to `running`.
    ///
    /// Returns the run's terminal state instead if it was already finalized.
    pub async fn mark_running(&self) -> WorkerResult<Option<ScanState>> {
        if self.store.mark_scan_running(&self.scan_id).await? {
            tracing::info!(scan_id = %self.scan_id, "Scan run started");
            return Ok(None);
        }
        match self.store.get_scan_run(&self.scan_id).await? {
            Some(run) => Ok(Some(run.state)),
            None => Err(WorkerError::ScanRunNotFound(self.scan_id.clone())),
        }
    }

    pub fn record_discovered(&mut self) {
        self.counters.files_discovered += 1;
    }

    pub fn set_errors(&mut self, errors: u64) {
        self.counters.errors = errors as i64;
    }

    /// Record writer totals after a flush and persist the counters
    pub async fn record_flush(&mut self, persisted: u64, batches_flushed: u64) -> WorkerResult<()> {
        self.counters.files_persisted = persisted as i64;
        self.counters.batches_flushed = batches_flushed as i64;
        self.store
            .update_scan_counters(&self.scan_id, &self.counters)
            .await?;
        Ok(())
    }

    /// Finalize the run. Returns false if another actor finalized it first.
    pub async fn finish(&self, state: ScanState, last_error: Option<&str>) -> WorkerResult<bool> {
        let finished = self
            .store
            .finish_scan_run(&self.scan_id, state, &self.counters, last_error)
            .await?;
        if finished {
            tracing::info!(
                scan_id = %self.scan_id,
                state = %state,
                files_discovered = self.counters.files_discovered,
                files_persisted = self.counters.files_persisted,
                batches_flushed = self.counters.batches_flushed,
                errors = self.counters.errors,
                "Scan run finished"
            );
        } else {
            tracing::warn!(scan_id = %self.scan_id, state = %state, "Scan run was already finalized");
        }
        Ok(finished)
    }

    /// Record a handler failure: final failures close the run as `failed`,
    /// retryable ones put it back to `queued`
    pub async fn record_failure(&self, err: &WorkerError, terminal: bool) -> WorkerResult<()> {
        let message = err.to_string();
        if terminal {
            self.finish(ScanState::Failed, Some(&message)).await?;
        } else {
            self.store.requeue_scan_run(&self.scan_id, &message).await?;
        }
        Ok(())
    }

    pub fn summary(&self, state: ScanState) -> ScanSummary {
        ScanSummary {
            scan_id: self.scan_id.clone(),
            state,
            counters: self.counters,
        }
    }
}

impl std::fmt::Debug for ScanRunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRunTracker")
            .field("scan_id", &self.scan_id)
            .field("counters", &self.counters)
            .finish()
    }
}
