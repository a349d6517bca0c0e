//! Dedup ledger: one `synced_records` row per source record.
//!
//! A row is created the first time the orchestrator touches a record and is
//! never deleted. Its presence alone is enough to skip re-delivery.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{format_ts, parse_ts, ProcessingStatus, StateError, SyncedRecord};
use crate::record::Record;

const RECORD_COLUMNS: &str = "record_id, destination_id, synced_at, title, start_time, end_time, \
     processing_status, retry_count, last_error, created_at";

/// Create the ledger row for a record, or reset an existing one to pending.
///
/// The retry counter and any destination id survive the reset.
pub fn upsert_pending(conn: &Connection, record: &Record) -> Result<(), StateError> {
    let now = format_ts(Utc::now());
    conn.execute(
        "INSERT INTO synced_records \
             (record_id, synced_at, title, start_time, end_time, processing_status, retry_count, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?2) \
         ON CONFLICT(record_id) DO UPDATE SET \
             synced_at = excluded.synced_at, \
             title = excluded.title, \
             start_time = excluded.start_time, \
             end_time = excluded.end_time, \
             processing_status = 'pending'",
        params![
            record.id,
            now,
            record.title,
            format_ts(record.start_time),
            format_ts(record.end_time),
        ],
    )?;
    Ok(())
}

/// Move a record to `status`.
///
/// The retry counter increments only on a transition into
/// [`ProcessingStatus::Retry`]. A `None` destination id keeps the stored one;
/// `last_error` is overwritten (cleared when `None`).
pub fn update_status(
    conn: &Connection,
    record_id: &str,
    status: ProcessingStatus,
    destination_id: Option<i64>,
    last_error: Option<&str>,
) -> Result<(), StateError> {
    let retry_increment = i64::from(status == ProcessingStatus::Retry);
    let changed = conn.execute(
        "UPDATE synced_records SET \
             processing_status = ?1, \
             destination_id = COALESCE(?2, destination_id), \
             retry_count = retry_count + ?3, \
             last_error = ?4, \
             synced_at = ?5 \
         WHERE record_id = ?6",
        params![
            status.as_str(),
            destination_id,
            retry_increment,
            last_error,
            format_ts(Utc::now()),
            record_id,
        ],
    )?;

    if changed == 0 {
        return Err(StateError::UnknownRecord(record_id.to_string()));
    }
    tracing::debug!(record_id, status = %status, "record status updated");
    Ok(())
}

/// Whether the ledger has any row for this record.
pub fn is_synced(conn: &Connection, record_id: &str) -> Result<bool, StateError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM synced_records WHERE record_id = ?1)",
        [record_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn get_synced_record(
    conn: &Connection,
    record_id: &str,
) -> Result<Option<SyncedRecord>, StateError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM synced_records WHERE record_id = ?1"),
            [record_id],
            RawSyncedRecord::from_row,
        )
        .optional()?;
    raw.map(RawSyncedRecord::into_record).transpose()
}

/// Records in `failed` or `retry` whose retry count is still below `max_retries`.
pub fn retryable_records(
    conn: &Connection,
    max_retries: u32,
) -> Result<Vec<SyncedRecord>, StateError> {
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM synced_records \
             WHERE processing_status IN ('failed', 'retry') AND retry_count < ?1 \
             ORDER BY synced_at ASC"
        ),
        params![max_retries],
    )
}

/// Records left `pending` or `processing` since before `before`.
///
/// Only an interrupted delivery leaves a row in either state, so these are
/// recovered by the retry sweep whatever their retry count.
pub fn stranded_records(
    conn: &Connection,
    before: DateTime<Utc>,
) -> Result<Vec<SyncedRecord>, StateError> {
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM synced_records \
             WHERE processing_status IN ('pending', 'processing') AND synced_at < ?1 \
             ORDER BY created_at ASC"
        ),
        params![format_ts(before)],
    )
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SyncedRecord>, StateError> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawSyncedRecord::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawSyncedRecord::into_record).collect()
}

/// Column values as stored, before status and timestamp validation.
struct RawSyncedRecord {
    record_id: String,
    destination_id: Option<i64>,
    synced_at: String,
    title: String,
    start_time: String,
    end_time: String,
    processing_status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: String,
}

impl RawSyncedRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            destination_id: row.get(1)?,
            synced_at: row.get(2)?,
            title: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            processing_status: row.get(6)?,
            retry_count: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<SyncedRecord, StateError> {
        Ok(SyncedRecord {
            processing_status: self.processing_status.parse()?,
            synced_at: parse_ts(&self.synced_at)?,
            start_time: parse_ts(&self.start_time)?,
            end_time: parse_ts(&self.end_time)?,
            created_at: parse_ts(&self.created_at)?,
            record_id: self.record_id,
            destination_id: self.destination_id,
            title: self.title,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
        })
    }
}

