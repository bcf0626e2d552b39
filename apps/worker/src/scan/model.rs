//! Scan run and scan file records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;

/// Lifecycle state of a scan run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkerError::Internal(format!(
                "unknown scan state '{}' in scan_runs",
                other
            ))),
        }
    }
}

/// Progress counters of one scan run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCounters {
    pub files_discovered: i64,
    pub files_persisted: i64,
    pub batches_flushed: i64,
    pub errors: i64,
}

/// One logical invocation of the directory scanner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRun {
    pub scan_id: String,
    pub job_id: Uuid,
    pub user_id: String,
    pub root_path: String,
    pub state: ScanState,
    #[serde(flatten)]
    pub counters: ScanCounters,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request for a scan run, created `queued` alongside its job
#[derive(Debug, Clone)]
pub struct NewScanRun {
    pub scan_id: String,
    pub job_id: Uuid,
    pub user_id: String,
    pub root_path: String,
}

/// One indexed file belonging to a scan run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFile {
    pub scan_file_id: Uuid,
    pub scan_id: String,
    pub path: String,
    pub size_bytes: i64,
    pub mtime_ms: i64,
    pub extension: String,
}

/// Returned to the queue as the job result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scan_id: String,
    pub state: ScanState,
    #[serde(flatten)]
    pub counters: ScanCounters,
}
