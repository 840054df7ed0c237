//! Sync bookkeeping models
//!
//! Results and status reported by the background sync harness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one run of a background task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Number of records written
    pub records_updated: u64,

    /// Whether the run did nothing (disabled, nothing to do)
    pub skipped: bool,

    /// Optional message
    pub message: Option<String>,
}

impl SyncResult {
    /// Create a skipped sync result
    pub fn skipped() -> Self {
        Self {
            records_updated: 0,
            skipped: true,
            message: None,
        }
    }

    /// Create a successful sync result
    pub fn success(records_updated: u64) -> Self {
        Self {
            records_updated,
            skipped: false,
            message: None,
        }
    }

    /// Add a message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Status of a background task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Task name
    pub source: String,

    /// When the last run finished
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Status of the last run
    pub status: SyncStatusValue,

    /// Error message if the last run failed
    pub error_message: Option<String>,

    /// Records written by the last run
    pub records_count: u64,
}

impl SyncStatus {
    /// Create a new sync status
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last_sync_at: None,
            status: SyncStatusValue::Pending,
            error_message: None,
            records_count: 0,
        }
    }

    /// Mark as successful
    pub fn success(mut self, records_count: u64) -> Self {
        self.last_sync_at = Some(Utc::now());
        self.status = SyncStatusValue::Success;
        self.error_message = None;
        self.records_count = records_count;
        self
    }

    /// Mark as failed
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.last_sync_at = Some(Utc::now());
        self.status = SyncStatusValue::Failed;
        self.error_message = Some(error.into());
        self
    }

    /// Mark as in progress
    pub fn in_progress(mut self) -> Self {
        self.status = SyncStatusValue::InProgress;
        self
    }
}

/// Status value for sync operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusValue {
    /// Task has never run
    #[default]
    Pending,
    /// Task is currently running
    InProgress,
    /// Last run was successful
    Success,
    /// Last run failed
    Failed,
}

impl std::fmt::Display for SyncStatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatusValue::Pending => write!(f, "pending"),
            SyncStatusValue::InProgress => write!(f, "in_progress"),
            SyncStatusValue::Success => write!(f, "success"),
            SyncStatusValue::Failed => write!(f, "failed"),
        }
    }
}
