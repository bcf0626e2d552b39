//! `scan.directory` job handler
//!
//! Resolves and confines the scan root, then drives the walker into the
//! batch writer. Between entries the handler enforces the runtime budget and
//! honours cancellation; after every flush it persists counters, reports
//! progress and re-reads the cancellation flag.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::model::ScanState;
use super::tracker::ScanRunTracker;
use super::walker::{DirectoryWalker, FileDescriptor, WalkOptions};
use super::writer::ScanBatchWriter;
use crate::config::ScanConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::queue::{JobType, ScanDirectoryPayload, ScanOptions};
use crate::store::ScanStore;
use crate::worker::{JobContext, JobHandler, JobOutcome};

/// Handler for [`JobType::SCAN_DIRECTORY`]
pub struct ScanDirectoryHandler {
    store: Arc<dyn ScanStore>,
    config: ScanConfig,
}

impl ScanDirectoryHandler {
    pub fn new(store: Arc<dyn ScanStore>, config: ScanConfig) -> Self {
        Self { store, config }
    }

    /// Payload options bounded by the configured ceilings
    pub fn walk_options(&self, options: &ScanOptions) -> WalkOptions {
        let max_depth = options
            .max_depth
            .map_or(self.config.max_depth, |depth| {
                (depth as usize).min(self.config.max_depth)
            });
        let max_files = options
            .max_files
            .map_or(self.config.max_files, |files| {
                usize::try_from(files)
                    .unwrap_or(usize::MAX)
                    .min(self.config.max_files)
            });

        WalkOptions::new(max_depth, max_files)
            .ignore_names(options.ignore_directories.iter().cloned())
            .ignore_extensions(&options.ignore_extensions)
    }

    async fn scan(
        &self,
        ctx: &JobContext,
        payload: &ScanDirectoryPayload,
        tracker: &mut ScanRunTracker,
    ) -> WorkerResult<JobOutcome> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.max_job_runtime_secs);

        let root = resolve_contained_root(&payload.root_path, &payload.allowed_roots).await?;

        if !ctx.confirm_lease().await? {
            return Err(ctx.lease_lost_error());
        }
        if let Some(state) = tracker.mark_running().await? {
            return finalized_elsewhere(tracker, state);
        }

        let mut writer = ScanBatchWriter::new(
            self.store.clone(),
            tracker.scan_id(),
            self.config.batch_size,
            self.config.max_db_batch_size,
        );
        let errors = Arc::new(AtomicU64::new(0));

        if ctx.is_cancel_requested() {
            return cancel(ctx, tracker, &mut writer, &errors).await;
        }

        let mut walker = open_walker(root, self.walk_options(&payload.options), errors.clone()).await?;
        let chunk_size = writer.batch_size();

        loop {
            let (returned, chunk) =
                tokio::task::spawn_blocking(move || next_chunk(walker, chunk_size)).await?;
            walker = returned;
            let exhausted = chunk.len() < chunk_size;

            for file in chunk {
                if ctx.is_lease_lost() {
                    return Err(ctx.lease_lost_error());
                }
                if started.elapsed() > budget {
                    return Err(WorkerError::Timeout {
                        seconds: self.config.max_job_runtime_secs,
                    });
                }
                if ctx.is_cancel_requested() {
                    return cancel(ctx, tracker, &mut writer, &errors).await;
                }

                tracker.record_discovered();
                if writer.push(file).await? {
                    after_flush(ctx, tracker, &writer, &errors).await?;
                }
            }

            if exhausted {
                break;
            }
        }

        if writer.flush().await? > 0 {
            after_flush(ctx, tracker, &writer, &errors).await?;
        }
        if !ctx.confirm_lease().await? {
            return Err(ctx.lease_lost_error());
        }
        tracker.set_errors(errors.load(Ordering::Relaxed));
        tracker.finish(ScanState::Succeeded, None).await?;

        Ok(JobOutcome::Succeeded(serde_json::to_value(
            tracker.summary(ScanState::Succeeded),
        )?))
    }
}

#[async_trait]
impl JobHandler for ScanDirectoryHandler {
    fn job_type(&self) -> JobType {
        JobType::SCAN_DIRECTORY
    }

    #[tracing::instrument(skip_all, fields(scan_id = tracing::field::Empty))]
    async fn run(&self, ctx: &JobContext) -> WorkerResult<JobOutcome> {
        let payload = ScanDirectoryPayload::from_value(&ctx.job().payload)?;
        tracing::Span::current().record("scan_id", payload.scan_id.as_str());

        let mut tracker = ScanRunTracker::new(self.store.clone(), payload.scan_id.clone());
        match self.scan(ctx, &payload, &mut tracker).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The scan run belongs to whoever holds the lease now
                match ctx.confirm_lease().await {
                    Ok(true) => {
                        let terminal = !err.is_retryable() || ctx.job().is_final_attempt();
                        if let Err(record_err) = tracker.record_failure(&err, terminal).await {
                            record_err.log();
                        }
                    }
                    Ok(false) => {
                        tracing::warn!(error = %err, "Lease lost, scan run left untouched");
                        return Err(ctx.lease_lost_error());
                    }
                    Err(lease_err) => lease_err.log(),
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ScanDirectoryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDirectoryHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Canonicalize `root` and require it to sit inside one of `allowed_roots`.
///
/// Allowed roots are canonicalized too. A root that cannot be resolved is
/// still rejected as an escape when it lies lexically outside every allowed
/// root; otherwise it is reported as unreadable.
pub async fn resolve_contained_root(root: &str, allowed_roots: &[String]) -> WorkerResult<PathBuf> {
    let mut allowed = Vec::with_capacity(allowed_roots.len());
    for candidate in allowed_roots {
        let resolved = match tokio::fs::canonicalize(candidate).await {
            Ok(path) => path,
            Err(_) => normalize_lexically(Path::new(candidate)),
        };
        allowed.push(resolved);
    }

    let resolved = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        Err(err) => {
            let lexical = normalize_lexically(Path::new(root));
            if !allowed.iter().any(|a| lexical.starts_with(a)) {
                return Err(WorkerError::path_escape(root, allowed_roots));
            }
            return Err(WorkerError::root_unreadable(root, err));
        }
    };

    if !allowed.iter().any(|a| resolved.starts_with(a)) {
        return Err(WorkerError::path_escape(
            resolved.display().to_string(),
            allowed_roots,
        ));
    }
    Ok(resolved)
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

async fn open_walker(
    root: PathBuf,
    options: WalkOptions,
    errors: Arc<AtomicU64>,
) -> WorkerResult<DirectoryWalker> {
    let display = root.display().to_string();
    tokio::task::spawn_blocking(move || {
        DirectoryWalker::new(root, options, move |path, err| {
            errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
        })
    })
    .await?
    .map_err(|err| WorkerError::root_unreadable(display, err))
}

/// Pull up to `n` descriptors off the walker on a blocking thread
fn next_chunk(mut walker: DirectoryWalker, n: usize) -> (DirectoryWalker, Vec<FileDescriptor>) {
    let chunk = walker.by_ref().take(n).collect();
    (walker, chunk)
}

async fn after_flush(
    ctx: &JobContext,
    tracker: &mut ScanRunTracker,
    writer: &ScanBatchWriter,
    errors: &AtomicU64,
) -> WorkerResult<()> {
    tracker.set_errors(errors.load(Ordering::Relaxed));
    let mut counters = tracker.counters();
    counters.files_persisted = writer.persisted() as i64;
    counters.batches_flushed = writer.batches_flushed() as i64;
    if !ctx.report_progress(serde_json::to_value(counters)?).await? {
        return Err(ctx.lease_lost_error());
    }
    tracker
        .record_flush(writer.persisted(), writer.batches_flushed())
        .await?;
    if ctx.refresh_cancel().await? {
        tracing::info!(scan_id = tracker.scan_id(), "Cancellation observed after flush");
    }
    Ok(())
}

/// Flush what is buffered and close the run as cancelled
async fn cancel(
    ctx: &JobContext,
    tracker: &mut ScanRunTracker,
    writer: &mut ScanBatchWriter,
    errors: &AtomicU64,
) -> WorkerResult<JobOutcome> {
    if !ctx.confirm_lease().await? {
        return Err(ctx.lease_lost_error());
    }
    if writer.flush().await? > 0 {
        tracker.set_errors(errors.load(Ordering::Relaxed));
        tracker
            .record_flush(writer.persisted(), writer.batches_flushed())
            .await?;
    }
    tracker.set_errors(errors.load(Ordering::Relaxed));
    tracker.finish(ScanState::Cancelled, None).await?;
    tracing::info!(job_id = %ctx.job_id(), scan_id = tracker.scan_id(), "Scan cancelled");

    Ok(JobOutcome::Cancelled(serde_json::to_value(
        tracker.summary(ScanState::Cancelled),
    )?))
}

/// The run reached a terminal state before this attempt started
fn finalized_elsewhere(tracker: &ScanRunTracker, state: ScanState) -> WorkerResult<JobOutcome> {
    tracing::warn!(scan_id = tracker.scan_id(), state = %state, "Scan run already finalized");
    let summary = serde_json::to_value(tracker.summary(state))?;
    match state {
        ScanState::Cancelled => Ok(JobOutcome::Cancelled(summary)),
        ScanState::Succeeded => Ok(JobOutcome::Succeeded(summary)),
        _ => Err(WorkerError::InvalidJobData(format!(
            "scan run {} is already {}",
            tracker.scan_id(),
            state
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use resonance_test_utils::TempLibrary;

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/music/./a/../b")),
            PathBuf::from("/music/b")
        );
        assert_eq!(
            normalize_lexically(Path::new("/music/../etc")),
            PathBuf::from("/etc")
        );
    }

    #[tokio::test]
    async fn test_root_inside_allowed_root() {
        let library = TempLibrary::new();
        library.add_file("artist/album/01.mp3", b"x");
        let allowed = vec![library.root().display().to_string()];
        let root = library.root().join("artist").display().to_string();

        let resolved = resolve_contained_root(&root, &allowed).await.unwrap();
        assert!(resolved.ends_with("artist"));
    }

    #[tokio::test]
    async fn test_dotdot_escape_is_rejected() {
        let library = TempLibrary::new();
        library.add_file("music/a.mp3", b"x");
        library.add_file("private/b.mp3", b"x");
        let allowed = vec![library.root().join("music").display().to_string()];
        let root = library.root().join("music/../private").display().to_string();

        let result = resolve_contained_root(&root, &allowed).await;
        assert_matches!(result, Err(WorkerError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn test_missing_root_outside_allowed_is_escape() {
        let library = TempLibrary::new();
        let allowed = vec![library.root().display().to_string()];

        let result = resolve_contained_root("/definitely/not/here", &allowed).await;
        assert_matches!(result, Err(WorkerError::PathEscape { .. }));

        let inside = library.root().join("missing").display().to_string();
        let result = resolve_contained_root(&inside, &allowed).await;
        assert_matches!(result, Err(WorkerError::RootUnreadable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_allowed_root_is_escape() {
        let inside = TempLibrary::new();
        let outside = TempLibrary::new();
        outside.add_file("secret.mp3", b"x");
        std::os::unix::fs::symlink(outside.root(), inside.root().join("link")).unwrap();

        let allowed = vec![inside.root().display().to_string()];
        let root = inside.root().join("link").display().to_string();
        let result = resolve_contained_root(&root, &allowed).await;
        assert_matches!(result, Err(WorkerError::PathEscape { .. }));
    }

    #[test]
    fn test_walk_options_clamped_to_config() {
        let handler = ScanDirectoryHandler::new(
            Arc::new(crate::store::MemoryStore::new()),
            ScanConfig {
                max_depth: 5,
                max_files: 100,
                ..ScanConfig::default()
            },
        );

        let options = handler.walk_options(&ScanOptions {
            max_depth: Some(50),
            max_files: Some(10),
            ignore_directories: vec!["@eaDir".to_string()],
            ignore_extensions: vec![".WAV".to_string()],
        });
        assert_eq!(options.max_depth, 5);
        assert_eq!(options.max_files, 10);
        assert!(options.ignore_names.contains("@eaDir"));
        assert!(options.ignore_extensions.contains("wav"));

        let options = handler.walk_options(&ScanOptions::default());
        assert_eq!(options.max_depth, 5);
        assert_eq!(options.max_files, 100);
    }
}
