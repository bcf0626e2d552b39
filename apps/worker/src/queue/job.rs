//! Job records and lease snapshots

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;

/// Job type discriminator, e.g. `scan.directory`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    /// Walk a directory tree and index the audio files found
    pub const SCAN_DIRECTORY: JobType = JobType(Cow::Borrowed("scan.directory"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Succeeded, failed and cancelled are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkerError::Internal(format!(
                "unknown job state '{}' in job_queue",
                other
            ))),
        }
    }
}

/// A persisted job record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Epoch seconds before which the job is not leasable
    pub run_after: i64,
    /// Epoch seconds; `None` unless running
    pub leased_until: Option<i64>,
    pub lease_owner: Option<String>,
    pub cancel_requested: bool,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Queued and due, or running with an expired lease
    pub fn is_leasable(&self, now: i64) -> bool {
        match self.state {
            JobState::Queued => self.run_after <= now,
            JobState::Running => self.leased_until.map_or(true, |until| until <= now),
            _ => false,
        }
    }
}

/// Insert request for a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    /// `None` schedules the job for the store's current time
    pub run_after: Option<i64>,
}

/// Snapshot handed to a worker after a successful lease
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Includes the lease that produced this snapshot
    pub attempts: i32,
    pub max_attempts: i32,
    pub leased_until: i64,
    pub lease_owner: String,
    pub cancel_requested: bool,
}

impl LeasedJob {
    /// True when a failure now would be the last allowed attempt
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Result of a successful heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub leased_until: i64,
    pub cancel_requested: bool,
}

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { job_id: Uuid },
    /// Queue is at its configured length; a backpressure signal, not a fault
    QueueFull,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Queued { job_id } => Some(*job_id),
            Self::QueueFull => None,
        }
    }

    /// Machine-readable rejection reason
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Queued { .. } => None,
            Self::QueueFull => Some("queue_full"),
        }
    }
}

/// Optional scheduling parameters for enqueue
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<i32>,
    /// Epoch seconds
    pub run_after: Option<i64>,
}

/// What `mark_failed` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued; leasable again after `delay_secs`
    Retry { delay_secs: i64 },
    /// Terminal failure, no attempts left
    Failed,
    /// The caller no longer held the lease; nothing was written
    LeaseLost,
}

/// Count of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub(crate) fn add(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Running => self.running += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::Failed => self.failed += count,
            JobState::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(state: JobState, run_after: i64, leased_until: Option<i64>) -> Job {
        Job {
            job_id: Uuid::new_v4(),
            job_type: JobType::SCAN_DIRECTORY,
            payload: serde_json::Value::Null,
            state,
            attempts: 0,
            max_attempts: 3,
            run_after,
            leased_until,
            lease_owner: None,
            cancel_requested: false,
            progress: None,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_leasable_invariant() {
        assert!(job(JobState::Queued, 100, None).is_leasable(100));
        assert!(!job(JobState::Queued, 101, None).is_leasable(100));
        assert!(job(JobState::Running, 0, Some(100)).is_leasable(100));
        assert!(!job(JobState::Running, 0, Some(101)).is_leasable(100));
        assert!(!job(JobState::Succeeded, 0, None).is_leasable(100));
        assert!(!job(JobState::Cancelled, 0, None).is_leasable(100));
    }

    #[test]
    fn test_state_round_trip_names() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_type_equality() {
        assert_eq!(JobType::from("scan.directory"), JobType::SCAN_DIRECTORY);
        assert_eq!(JobType::SCAN_DIRECTORY.to_string(), "scan.directory");
    }

    #[test]
    fn test_enqueue_outcome_reason() {
        assert_eq!(EnqueueOutcome::QueueFull.reason(), Some("queue_full"));
        assert!(!EnqueueOutcome::QueueFull.is_queued());
        let id = Uuid::new_v4();
        assert_eq!(EnqueueOutcome::Queued { job_id: id }.job_id(), Some(id));
    }
}
