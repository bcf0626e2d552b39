//! Directory scanning
//!
//! The `scan.directory` job walks a library root, persists every audio file
//! it finds into `scan_files` and tracks aggregate progress in `scan_runs`.

mod enqueue;
mod formats;
mod handler;
mod model;
mod tracker;
mod walker;
mod writer;

pub use enqueue::{enqueue_scan, new_scan_id, ScanEnqueueOutcome};
pub use formats::{audio_extension, is_audio_file, normalize_extension, AUDIO_EXTENSIONS};
pub use handler::{resolve_contained_root, ScanDirectoryHandler};
pub use model::{NewScanRun, ScanCounters, ScanFile, ScanRun, ScanState, ScanSummary};
pub use tracker::ScanRunTracker;
pub use walker::{DirectoryWalker, FileDescriptor, WalkErrorCallback, WalkOptions};
pub use writer::ScanBatchWriter;
