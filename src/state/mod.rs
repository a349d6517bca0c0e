//! Durable sync state: watermark, dedup ledger, error log and pass metrics.
//!
//! The free functions in the submodules operate on a borrowed
//! [`rusqlite::Connection`]. [`StateStore`] owns the shared connection and
//! runs each operation on the blocking pool, one at a time.

pub mod history;
pub mod ledger;
pub mod stats;
pub mod types;
pub mod watermark;

pub use types::{
    CleanupReport, NewSyncError, ProcessingStatus, StateError, SyncErrorRow, SyncMetricsRow,
    SyncStats, SyncWatermark, SyncedRecord,
};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::record::Record;

/// Shared handle to the state database.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `op` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, op: F) -> Result<T, StateError>
    where
        F: FnOnce(&Connection) -> Result<T, StateError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StateError::LockPoisoned)?;
            op(&conn)
        })
        .await
        .map_err(|e| StateError::Task(e.to_string()))?
    }

    pub async fn upsert_pending(&self, record: &Record) -> Result<(), StateError> {
        let record = record.clone();
        self.with_conn(move |conn| ledger::upsert_pending(conn, &record))
            .await
    }

    pub async fn update_status(
        &self,
        record_id: &str,
        status: ProcessingStatus,
        destination_id: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<(), StateError> {
        let record_id = record_id.to_string();
        let last_error = last_error.map(str::to_string);
        self.with_conn(move |conn| {
            ledger::update_status(conn, &record_id, status, destination_id, last_error.as_deref())
        })
        .await
    }

    pub async fn is_synced(&self, record_id: &str) -> Result<bool, StateError> {
        let record_id = record_id.to_string();
        self.with_conn(move |conn| ledger::is_synced(conn, &record_id))
            .await
    }

    pub async fn get_synced_record(
        &self,
        record_id: &str,
    ) -> Result<Option<SyncedRecord>, StateError> {
        let record_id = record_id.to_string();
        self.with_conn(move |conn| ledger::get_synced_record(conn, &record_id))
            .await
    }

    pub async fn retryable_records(&self, max_retries: u32) -> Result<Vec<SyncedRecord>, StateError> {
        self.with_conn(move |conn| ledger::retryable_records(conn, max_retries))
            .await
    }

    pub async fn stranded_records(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<SyncedRecord>, StateError> {
        self.with_conn(move |conn| ledger::stranded_records(conn, before))
            .await
    }

    pub async fn watermark(&self) -> Result<SyncWatermark, StateError> {
        self.with_conn(watermark::get_watermark).await
    }

    pub async fn advance_watermark(
        &self,
        sync_time: DateTime<Utc>,
        delivered: u64,
    ) -> Result<SyncWatermark, StateError> {
        self.with_conn(move |conn| watermark::advance_watermark(conn, sync_time, delivered))
            .await
    }

    pub async fn log_error(&self, error: NewSyncError) -> Result<i64, StateError> {
        self.with_conn(move |conn| history::log_error(conn, &error))
            .await
    }

    pub async fn recent_errors(&self, hours: i64) -> Result<Vec<SyncErrorRow>, StateError> {
        self.with_conn(move |conn| history::recent_errors(conn, hours))
            .await
    }

    pub async fn resolve_error(&self, error_id: i64) -> Result<bool, StateError> {
        self.with_conn(move |conn| history::resolve_error(conn, error_id))
            .await
    }

    pub async fn resolve_record_errors(&self, record_id: &str) -> Result<u64, StateError> {
        let record_id = record_id.to_string();
        self.with_conn(move |conn| history::resolve_record_errors(conn, &record_id))
            .await
    }

    pub async fn start_metrics(&self, started_at: DateTime<Utc>) -> Result<i64, StateError> {
        self.with_conn(move |conn| history::start_metrics(conn, started_at))
            .await
    }

    pub async fn finish_metrics(
        &self,
        metrics_id: i64,
        processed: u64,
        successful: u64,
        failed: u64,
    ) -> Result<SyncMetricsRow, StateError> {
        self.with_conn(move |conn| {
            history::finish_metrics(conn, metrics_id, processed, successful, failed)
        })
        .await
    }

    pub async fn recent_metrics(&self, days: i64) -> Result<Vec<SyncMetricsRow>, StateError> {
        self.with_conn(move |conn| history::recent_metrics(conn, days))
            .await
    }

    pub async fn latest_completed_metrics(&self) -> Result<Option<SyncMetricsRow>, StateError> {
        self.with_conn(history::latest_completed_metrics).await
    }

    pub async fn cleanup_old_data(&self, days: u32) -> Result<CleanupReport, StateError> {
        self.with_conn(move |conn| history::cleanup_old_data(conn, days))
            .await
    }

    pub async fn sync_stats(&self) -> Result<SyncStats, StateError> {
        self.with_conn(stats::sync_stats).await
    }

    /// `SELECT 1` against the connection.
    pub async fn ping(&self) -> Result<(), StateError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
