//! Batched, idempotent persistence of walker output

use std::sync::Arc;

use super::walker::FileDescriptor;
use crate::error::WorkerResult;
use crate::store::ScanStore;

/// Buffers descriptors and flushes them as `(scan_id, path)` upserts
///
/// The buffer is only cleared after a flush succeeds, so a failed flush can
/// be retried as-is. Re-flushing rows that already landed is harmless.
pub struct ScanBatchWriter {
    store: Arc<dyn ScanStore>,
    scan_id: String,
    batch_size: usize,
    buffer: Vec<FileDescriptor>,
    persisted: u64,
    batches_flushed: u64,
}

impl ScanBatchWriter {
    /// `requested` is clamped to `1..=max_batch_size`
    pub fn new(
        store: Arc<dyn ScanStore>,
        scan_id: impl Into<String>,
        requested: usize,
        max_batch_size: usize,
    ) -> Self {
        let batch_size = requested.clamp(1, max_batch_size.max(1));
        Self {
            store,
            scan_id: scan_id.into(),
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            persisted: 0,
            batches_flushed: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total descriptors written by successful flushes
    pub fn persisted(&self) -> u64 {
        self.persisted
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    /// Buffer one descriptor, flushing when the batch is full.
    /// Returns whether a flush happened.
    pub async fn push(&mut self, file: FileDescriptor) -> WorkerResult<bool> {
        self.buffer.push(file);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write everything buffered. Yields to the scheduler afterwards.
    pub async fn flush(&mut self) -> WorkerResult<u64> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let written = self
            .store
            .upsert_scan_files(&self.scan_id, &self.buffer)
            .await?;
        let flushed = self.buffer.len() as u64;
        self.buffer.clear();
        self.persisted += flushed;
        self.batches_flushed += 1;

        tracing::debug!(
            scan_id = %self.scan_id,
            flushed,
            written,
            persisted = self.persisted,
            batches = self.batches_flushed,
            "Flushed scan batch"
        );

        tokio::task::yield_now().await;
        Ok(flushed)
    }
}

impl std::fmt::Debug for ScanBatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanBatchWriter")
            .field("scan_id", &self.scan_id)
            .field("batch_size", &self.batch_size)
            .field("buffered", &self.buffer.len())
            .field("persisted", &self.persisted)
            .field("batches_flushed", &self.batches_flushed)
            .finish()
    }
}
