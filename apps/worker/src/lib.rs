//! Resonance background worker
//!
//! A durable, lease-based job queue backed by PostgreSQL and the worker that
//! drains it. The built-in job type is `scan.directory`, which walks a music
//! library root and indexes the audio files it finds.
//!
//! - [`queue`] - enqueue, lease, heartbeat and terminal transitions
//! - [`store`] - persistence traits with Postgres and in-memory backends
//! - [`worker`] - the polling loop and the [`worker::JobHandler`] seam
//! - [`limiter`] - global and per-type in-process concurrency caps
//! - [`scan`] - directory walker, batch writer, run tracker and handler

pub mod config;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod scan;
pub mod store;
pub mod worker;

pub use config::{Config, ScanConfig};
pub use error::{ErrorSeverity, WorkerError, WorkerResult};
pub use limiter::{InflightLimiter, InflightPermit};
pub use queue::{JobQueueService, JobState, JobType};
pub use worker::{JobContext, JobHandler, JobOutcome, WorkerLoop};
