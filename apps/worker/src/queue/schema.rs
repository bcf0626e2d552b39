//! Payload schemas keyed by job type
//!
//! Every job type accepted by the queue registers a validator here. Enqueue
//! rejects payloads synchronously, so malformed work never reaches a worker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::job::JobType;
use crate::error::{WorkerError, WorkerResult};

/// Validates a raw payload for one job type
pub type PayloadValidator = fn(&serde_json::Value) -> WorkerResult<()>;

/// Registry of payload validators
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: HashMap<JobType, PayloadValidator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in job type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(JobType::SCAN_DIRECTORY, ScanDirectoryPayload::validate_value);
        registry
    }

    pub fn register(&mut self, job_type: JobType, validator: PayloadValidator) -> &mut Self {
        self.validators.insert(job_type, validator);
        self
    }

    pub fn validate(&self, job_type: &JobType, payload: &serde_json::Value) -> WorkerResult<()> {
        let validator = self
            .validators
            .get(job_type)
            .ok_or_else(|| WorkerError::UnknownJobType(job_type.to_string()))?;
        validator(payload)
    }

    pub fn knows(&self, job_type: &JobType) -> bool {
        self.validators.contains_key(job_type)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

/// Payload for `scan.directory`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDirectoryPayload {
    pub scan_id: String,
    pub user_id: String,
    pub root_path: String,
    pub allowed_roots: Vec<String>,
    pub options: ScanOptions,
}

/// Traversal options carried by a scan job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u64>,
    #[serde(default)]
    pub ignore_directories: Vec<String>,
    #[serde(default)]
    pub ignore_extensions: Vec<String>,
}

impl ScanDirectoryPayload {
    /// Parse and validate a raw payload
    pub fn from_value(value: &serde_json::Value) -> WorkerResult<Self> {
        let payload: Self = serde_json::from_value(value.clone())
            .map_err(|e| WorkerError::InvalidPayload(format!("scan.directory: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate_value(value: &serde_json::Value) -> WorkerResult<()> {
        Self::from_value(value).map(|_| ())
    }

    pub fn validate(&self) -> WorkerResult<()> {
        require_non_empty("scanId", &self.scan_id)?;
        require_non_empty("userId", &self.user_id)?;
        require_non_empty("rootPath", &self.root_path)?;

        if self.allowed_roots.is_empty() {
            return Err(WorkerError::InvalidPayload(
                "allowedRoots must contain at least one path".to_string(),
            ));
        }
        for root in &self.allowed_roots {
            require_non_empty("allowedRoots[]", root)?;
        }

        if self.options.max_depth == Some(0) {
            return Err(WorkerError::InvalidPayload(
                "options.maxDepth must be a positive integer".to_string(),
            ));
        }
        if self.options.max_files == Some(0) {
            return Err(WorkerError::InvalidPayload(
                "options.maxFiles must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> WorkerResult<()> {
    if value.trim().is_empty() {
        return Err(WorkerError::InvalidPayload(format!(
            "{} must be a non-empty string",
            field
        )));
    }
    Ok(())
}
