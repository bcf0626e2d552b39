//! Worker configuration loaded from environment variables
//!
//! Built once at startup and handed to the queue service, the worker loop
//! and the scan handler. Every variable has a default suitable for local
//! development; values that fail to parse are startup errors.

use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context, Result};
use resonance_shared_config::{parse_env, CommonConfig, DatabaseConfig, Environment, QueueConfig};

use crate::queue::JobType;

/// Limits applied to `scan.directory` jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Requested flush size, clamped to `max_db_batch_size`
    pub batch_size: usize,

    /// Hard ceiling on rows per upsert
    pub max_db_batch_size: usize,

    /// Default cap on concurrently running scans in one process
    pub max_fs_concurrency: usize,

    /// Ceiling for the payload's `maxDepth`
    pub max_depth: usize,

    /// Ceiling for the payload's `maxFiles`
    pub max_files: usize,

    /// Wall-clock budget of one scan attempt
    pub max_job_runtime_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_db_batch_size: 500,
            max_fs_concurrency: 2,
            max_depth: 32,
            max_files: 100_000,
            max_job_runtime_secs: 3_600,
        }
    }
}

impl ScanConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_env("SCAN_BATCH_SIZE", defaults.batch_size)?,
            max_db_batch_size: parse_env("SCAN_MAX_DB_BATCH_SIZE", defaults.max_db_batch_size)?,
            max_fs_concurrency: parse_env("SCAN_MAX_FS_CONCURRENCY", defaults.max_fs_concurrency)?,
            max_depth: parse_env("SCAN_MAX_DEPTH", defaults.max_depth)?,
            max_files: parse_env("SCAN_MAX_FILES", defaults.max_files)?,
            max_job_runtime_secs: parse_env(
                "JOB_MAX_RUNTIME_SECS",
                defaults.max_job_runtime_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_db_batch_size == 0 {
            bail!("SCAN_MAX_DB_BATCH_SIZE must be at least 1");
        }
        if self.max_fs_concurrency == 0 {
            bail!("SCAN_MAX_FS_CONCURRENCY must be at least 1");
        }
        if self.max_files == 0 {
            bail!("SCAN_MAX_FILES must be at least 1");
        }
        if self.max_job_runtime_secs == 0 {
            bail!("JOB_MAX_RUNTIME_SECS must be at least 1");
        }
        Ok(())
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Lease owner token of this process
    pub worker_id: String,

    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,

    /// Per-type overrides from `WORKER_TYPE_CONCURRENCY`
    pub type_concurrency: HashMap<JobType, usize>,

    /// Directory scan limits
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let max_concurrent_jobs: usize = parse_env("WORKER_MAX_CONCURRENT_JOBS", 4)?;
        if max_concurrent_jobs == 0 {
            bail!("WORKER_MAX_CONCURRENT_JOBS must be at least 1");
        }

        let type_concurrency = parse_type_concurrency(
            &env::var("WORKER_TYPE_CONCURRENCY").unwrap_or_default(),
        )
        .context("Invalid WORKER_TYPE_CONCURRENCY value")?;

        Ok(Self {
            common,
            worker_id: env::var("WORKER_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(default_worker_id),
            max_concurrent_jobs,
            type_concurrency,
            scan: ScanConfig::from_env()?,
        })
    }

    /// In-process ceiling: the worker's own cap bounded by the queue's inflight limit
    pub fn global_concurrency(&self) -> usize {
        self.max_concurrent_jobs.min(self.common.queue.max_inflight).max(1)
    }

    /// Per-type caps for the limiter. Scans default to `SCAN_MAX_FS_CONCURRENCY`.
    pub fn type_caps(&self) -> HashMap<JobType, usize> {
        let mut caps = self.type_concurrency.clone();
        caps.entry(JobType::SCAN_DIRECTORY)
            .or_insert(self.scan.max_fs_concurrency);
        caps
    }

    /// Get database configuration
    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    /// Get queue configuration
    pub fn queue(&self) -> &QueueConfig {
        &self.common.queue
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}

/// Parse `type=n,type=n` into per-type caps. Blank input means no overrides.
pub fn parse_type_concurrency(raw: &str) -> Result<HashMap<JobType, usize>> {
    let mut caps = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, cap) = entry
            .split_once('=')
            .with_context(|| format!("expected type=count, got '{}'", entry))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("missing job type in '{}'", entry);
        }
        let cap: usize = cap
            .trim()
            .parse()
            .with_context(|| format!("invalid count for '{}'", name))?;
        if cap == 0 {
            bail!("concurrency for '{}' must be at least 1", name);
        }
        caps.insert(JobType::new(name), cap);
    }
    Ok(caps)
}

fn default_worker_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}-{}", host, std::process::id(), &suffix[..8])
}
