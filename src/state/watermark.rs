//! The sync watermark: how far synchronization has progressed.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::types::{format_ts, parse_opt_ts, parse_ts, StateError, SyncWatermark};

pub fn get_watermark(conn: &Connection) -> Result<SyncWatermark, StateError> {
    let (last_sync_time, total_synced, updated_at): (Option<String>, i64, String) = conn
        .query_row(
            "SELECT last_sync_time, total_synced, updated_at FROM sync_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

    Ok(SyncWatermark {
        last_sync_time: parse_opt_ts(last_sync_time)?,
        total_synced: u64::try_from(total_synced).unwrap_or(0),
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Advance the watermark to `sync_time` and add `delivered` to the running total.
///
/// The stored time never moves backwards: an older `sync_time` leaves it as is.
/// Returns the watermark after the update.
pub fn advance_watermark(
    conn: &Connection,
    sync_time: DateTime<Utc>,
    delivered: u64,
) -> Result<SyncWatermark, StateError> {
    let current = get_watermark(conn)?;
    let next = current
        .last_sync_time
        .map_or(sync_time, |old| old.max(sync_time));

    conn.execute(
        "UPDATE sync_state SET last_sync_time = ?1, total_synced = total_synced + ?2, updated_at = ?3 \
         WHERE id = 1",
        params![
            format_ts(next),
            i64::try_from(delivered).unwrap_or(i64::MAX),
            format_ts(Utc::now()),
        ],
    )?;

    tracing::info!(watermark = %next, delivered, "watermark advanced");
    get_watermark(conn)
}
