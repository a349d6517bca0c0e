//! Error log and per-pass metrics, plus their retention cleanup.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{
    format_ts, parse_opt_ts, parse_ts, CleanupReport, NewSyncError, StateError, SyncErrorRow,
    SyncMetricsRow,
};

/// Append an error row. Returns its id.
pub fn log_error(conn: &Connection, error: &NewSyncError) -> Result<i64, StateError> {
    conn.execute(
        "INSERT INTO sync_errors (record_id, error_type, error_message, error_details, occurred_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            error.record_id,
            error.error_type,
            error.error_message,
            error.error_details,
            format_ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Errors that occurred within the last `hours`, newest first.
pub fn recent_errors(conn: &Connection, hours: i64) -> Result<Vec<SyncErrorRow>, StateError> {
    let since = format_ts(Utc::now() - Duration::hours(hours));
    let mut stmt = conn.prepare(
        "SELECT id, record_id, error_type, error_message, error_details, occurred_at, resolved_at \
         FROM sync_errors WHERE occurred_at > ?1 ORDER BY occurred_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([since], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, record_id, error_type, error_message, error_details, occurred_at, resolved_at)| {
                Ok(SyncErrorRow {
                    id,
                    record_id,
                    error_type,
                    error_message,
                    error_details,
                    occurred_at: parse_ts(&occurred_at)?,
                    resolved_at: parse_opt_ts(resolved_at)?,
                })
            },
        )
        .collect()
}

/// Stamp one error as resolved. Returns `false` if it was already resolved or missing.
pub fn resolve_error(conn: &Connection, error_id: i64) -> Result<bool, StateError> {
    let changed = conn.execute(
        "UPDATE sync_errors SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
        params![format_ts(Utc::now()), error_id],
    )?;
    Ok(changed > 0)
}

/// Stamp every open error of a record as resolved. Returns how many changed.
pub fn resolve_record_errors(conn: &Connection, record_id: &str) -> Result<u64, StateError> {
    let changed = conn.execute(
        "UPDATE sync_errors SET resolved_at = ?1 WHERE record_id = ?2 AND resolved_at IS NULL",
        params![format_ts(Utc::now()), record_id],
    )?;
    Ok(changed as u64)
}

/// Open a metrics row for a pass starting now. Returns its id.
pub fn start_metrics(conn: &Connection, started_at: DateTime<Utc>) -> Result<i64, StateError> {
    conn.execute(
        "INSERT INTO sync_metrics (sync_started_at) VALUES (?1)",
        [format_ts(started_at)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a metrics row with final counts.
///
/// Duration is measured from the stored start time; the average per-record
/// latency is derived from it when anything was processed.
pub fn finish_metrics(
    conn: &Connection,
    metrics_id: i64,
    processed: u64,
    successful: u64,
    failed: u64,
) -> Result<SyncMetricsRow, StateError> {
    let started: String = conn
        .query_row(
            "SELECT sync_started_at FROM sync_metrics WHERE id = ?1",
            [metrics_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StateError::UnknownRecord(format!("metrics {metrics_id}")))?;
    let started = parse_ts(&started)?;

    let completed = Utc::now();
    let duration_secs = (completed - started).num_milliseconds().max(0) as f64 / 1000.0;
    let average_ms = (processed > 0).then(|| duration_secs * 1000.0 / processed as f64);

    conn.execute(
        "UPDATE sync_metrics SET sync_completed_at = ?1, records_processed = ?2, \
             records_successful = ?3, records_failed = ?4, total_duration_seconds = ?5, \
             average_processing_time_ms = ?6 \
         WHERE id = ?7",
        params![
            format_ts(completed),
            processed as i64,
            successful as i64,
            failed as i64,
            duration_secs,
            average_ms,
            metrics_id,
        ],
    )?;

    get_metrics(conn, metrics_id)?
        .ok_or_else(|| StateError::UnknownRecord(format!("metrics {metrics_id}")))
}

const METRICS_COLUMNS: &str = "id, sync_started_at, sync_completed_at, records_processed, \
     records_successful, records_failed, total_duration_seconds, average_processing_time_ms";

pub fn get_metrics(conn: &Connection, metrics_id: i64) -> Result<Option<SyncMetricsRow>, StateError> {
    let raw = conn
        .query_row(
            &format!("SELECT {METRICS_COLUMNS} FROM sync_metrics WHERE id = ?1"),
            [metrics_id],
            RawMetrics::from_row,
        )
        .optional()?;
    raw.map(RawMetrics::into_row).transpose()
}

/// Passes started within the last `days`, newest first.
pub fn recent_metrics(conn: &Connection, days: i64) -> Result<Vec<SyncMetricsRow>, StateError> {
    let since = format_ts(Utc::now() - Duration::days(days));
    let mut stmt = conn.prepare(&format!(
        "SELECT {METRICS_COLUMNS} FROM sync_metrics WHERE sync_started_at > ?1 \
         ORDER BY sync_started_at DESC, id DESC"
    ))?;
    let raws = stmt
        .query_map([since], RawMetrics::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawMetrics::into_row).collect()
}

/// The most recent pass that ran to completion.
pub fn latest_completed_metrics(conn: &Connection) -> Result<Option<SyncMetricsRow>, StateError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {METRICS_COLUMNS} FROM sync_metrics WHERE sync_completed_at IS NOT NULL \
                 ORDER BY sync_completed_at DESC, id DESC LIMIT 1"
            ),
            [],
            RawMetrics::from_row,
        )
        .optional()?;
    raw.map(RawMetrics::into_row).transpose()
}

/// Delete error and metrics rows older than `days`, then `VACUUM`.
///
/// The dedup ledger is never touched.
pub fn cleanup_old_data(conn: &Connection, days: u32) -> Result<CleanupReport, StateError> {
    let cutoff = format_ts(Utc::now() - Duration::days(i64::from(days)));

    let errors_deleted = conn.execute("DELETE FROM sync_errors WHERE occurred_at < ?1", [&cutoff])?;
    let metrics_deleted =
        conn.execute("DELETE FROM sync_metrics WHERE sync_started_at < ?1", [&cutoff])?;
    conn.execute_batch("VACUUM")?;

    let report = CleanupReport {
        errors_deleted: errors_deleted as u64,
        metrics_deleted: metrics_deleted as u64,
    };
    tracing::info!(
        days,
        errors_deleted = report.errors_deleted,
        metrics_deleted = report.metrics_deleted,
        "retention cleanup complete"
    );
    Ok(report)
}

struct RawMetrics {
    id: i64,
    sync_started_at: String,
    sync_completed_at: Option<String>,
    records_processed: i64,
    records_successful: i64,
    records_failed: i64,
    total_duration_seconds: Option<f64>,
    average_processing_time_ms: Option<f64>,
}

impl RawMetrics {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sync_started_at: row.get(1)?,
            sync_completed_at: row.get(2)?,
            records_processed: row.get(3)?,
            records_successful: row.get(4)?,
            records_failed: row.get(5)?,
            total_duration_seconds: row.get(6)?,
            average_processing_time_ms: row.get(7)?,
        })
    }

    fn into_row(self) -> Result<SyncMetricsRow, StateError> {
        Ok(SyncMetricsRow {
            id: self.id,
            sync_started_at: parse_ts(&self.sync_started_at)?,
            sync_completed_at: parse_opt_ts(self.sync_completed_at)?,
            records_processed: self.records_processed.max(0) as u64,
            records_successful: self.records_successful.max(0) as u64,
            records_failed: self.records_failed.max(0) as u64,
            total_duration_seconds: self.total_duration_seconds,
            average_processing_time_ms: self.average_processing_time_ms,
        })
    }
}
