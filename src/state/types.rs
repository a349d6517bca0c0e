//! Row types and the status enum for the sync state store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Errors raised by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored status string outside the known set. Indicates corruption.
    #[error("unknown processing status in store: {0:?}")]
    UnknownStatus(String),

    #[error("unparseable timestamp in store: {0:?}")]
    Timestamp(String),

    #[error("no synced record with id {0}")]
    UnknownRecord(String),

    #[error("state store lock poisoned")]
    LockPoisoned,

    #[error("state store task failed: {0}")]
    Task(String),
}

/// Processing status of a record in the dedup ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Retry,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Processed,
        Self::Failed,
        Self::Retry,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StateError::UnknownStatus(s.to_string()))
    }
}

/// A row of the dedup ledger.
#[derive(Debug, Clone, Serialize)]
pub struct SyncedRecord {
    pub record_id: String,
    /// Destination-assigned id, set once the record has been created.
    pub destination_id: Option<i64>,
    /// Time of the last status change.
    pub synced_at: DateTime<Utc>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    /// Number of transitions into [`ProcessingStatus::Retry`].
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The single watermark row.
#[derive(Debug, Clone, Serialize)]
pub struct SyncWatermark {
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Cumulative records delivered across all passes.
    pub total_synced: u64,
    pub updated_at: DateTime<Utc>,
}

/// A row of the append-only error log.
#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorRow {
    pub id: i64,
    pub record_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub error_details: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An error to append to the log.
#[derive(Debug, Clone)]
pub struct NewSyncError {
    pub record_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub error_details: Option<String>,
}

impl NewSyncError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            record_id: None,
            error_type: error_type.into(),
            error_message: error_message.into(),
            error_details: None,
        }
    }

    pub fn for_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

/// One sync pass's metrics row.
#[derive(Debug, Clone, Serialize)]
pub struct SyncMetricsRow {
    pub id: i64,
    pub sync_started_at: DateTime<Utc>,
    pub sync_completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_successful: u64,
    pub records_failed: u64,
    pub total_duration_seconds: Option<f64>,
    pub average_processing_time_ms: Option<f64>,
}

/// Aggregate counters for status output and the detailed health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    /// Rows in the dedup ledger.
    pub total_synced: u64,
    /// Records delivered according to the watermark row.
    pub total_delivered: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub recent_syncs_24h: u64,
    pub recent_errors_24h: u64,
    pub status_breakdown: BTreeMap<String, u64>,
}

/// Rows removed by a retention cleanup.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub errors_deleted: u64,
    pub metrics_deleted: u64,
}

/// Store timestamps as fixed-width RFC3339 so string comparison orders them.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StateError::Timestamp(raw.to_string()))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StateError> {
    raw.as_deref().map(parse_ts).transpose()
}
