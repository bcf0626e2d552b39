//! Error handling for the Resonance Worker
//!
//! This module provides a unified error type hierarchy using thiserror
//! for the job queue, the worker loop and the directory scan handler.
//! Errors carry their own retry classification so the worker loop can
//! route a failed job to backoff or to terminal failure without knowing
//! which handler produced it.

use thiserror::Error;

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Enqueue / Validation Errors ==========
    /// Enqueue arguments outside the accepted range
    #[error("invalid job data: {0}")]
    InvalidJobData(String),

    /// Payload failed the schema registered for its job type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No schema or handler registered for a job type
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    // ========== Job Execution Errors ==========
    /// Handler exceeded its wall-clock budget
    #[error("job timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Scan root resolves outside every allowed root
    #[error("scan root '{path}' is outside the allowed roots {allowed:?}")]
    PathEscape { path: String, allowed: Vec<String> },

    /// Scan root could not be resolved or opened
    #[error("scan root '{path}' is unreadable: {reason}")]
    RootUnreadable { path: String, reason: String },

    /// Heartbeat or a lease-guarded write found another holder
    #[error("lease lost on job {0}")]
    LeaseLost(uuid::Uuid),

    /// Scan run row referenced by a job does not exist (yet)
    #[error("scan run not found: {0}")]
    ScanRunNotFound(String),

    // ========== Persistence Errors ==========
    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored JSON could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system access error
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    // ========== Configuration Errors ==========
    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    // ========== Internal Errors ==========
    /// Internal worker error (catch-all for unexpected errors)
    #[error("internal worker error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Check if this error is retryable
    ///
    /// Non-retryable errors exhaust a job's remaining attempts immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Filesystem(_)
                | Self::Timeout { .. }
                | Self::RootUnreadable { .. }
                | Self::ScanRunNotFound(_)
        )
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration(_) | Self::PathEscape { .. } => ErrorSeverity::Critical,

            Self::Database(_) | Self::Internal(_) | Self::Serialization(_) => ErrorSeverity::Error,

            Self::Timeout { .. }
            | Self::LeaseLost(_)
            | Self::RootUnreadable { .. }
            | Self::ScanRunNotFound(_)
            | Self::Filesystem(_) => ErrorSeverity::Warning,

            Self::InvalidJobData(_) | Self::InvalidPayload(_) | Self::UnknownJobType(_) => {
                ErrorSeverity::Info
            }
        }
    }

    /// Get the job type this error is related to, if applicable
    pub fn job_context(&self) -> Option<&'static str> {
        match self {
            Self::PathEscape { .. } | Self::RootUnreadable { .. } | Self::ScanRunNotFound(_) => {
                Some("scan.directory")
            }
            _ => None,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        let context = self.job_context().unwrap_or("general");
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Critical worker error"
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker error"
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker warning"
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker info"
                );
            }
        }
    }

    /// Create a path escape error
    pub fn path_escape(path: impl Into<String>, allowed: &[String]) -> Self {
        Self::PathEscape {
            path: path.into(),
            allowed: allowed.to_vec(),
        }
    }

    /// Create a root unreadable error
    pub fn root_unreadable(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::RootUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
    /// Informational messages
    Info,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

impl From<tokio::task::JoinError> for WorkerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {}", err))
    }
}
