use chrono::{Duration, Utc};
use rusqlite::Connection;
use std::collections::BTreeMap;

use super::types::{format_ts, StateError, SyncStats};
use super::watermark::get_watermark;

/// Ledger, watermark and 24-hour activity counters.
pub fn sync_stats(conn: &Connection) -> Result<SyncStats, StateError> {
    let watermark = get_watermark(conn)?;
    let since = format_ts(Utc::now() - Duration::hours(24));

    let count = |sql: &str, param: Option<&str>| -> Result<u64, StateError> {
        let n: i64 = match param {
            Some(p) => conn.query_row(sql, [p], |row| row.get(0))?,
            None => conn.query_row(sql, [], |row| row.get(0))?,
        };
        Ok(n.max(0) as u64)
    };

    let total_synced = count("SELECT COUNT(*) FROM synced_records", None)?;
    let recent_syncs_24h = count(
        "SELECT COUNT(*) FROM synced_records WHERE synced_at > ?1",
        Some(&since),
    )?;
    let recent_errors_24h = count(
        "SELECT COUNT(*) FROM sync_errors WHERE occurred_at > ?1",
        Some(&since),
    )?;

    let mut stmt = conn.prepare(
        "SELECT processing_status, COUNT(*) FROM synced_records GROUP BY processing_status",
    )?;
    let status_breakdown = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(SyncStats {
        total_synced,
        total_delivered: watermark.total_synced,
        last_sync_time: watermark.last_sync_time,
        recent_syncs_24h,
        recent_errors_24h,
        status_breakdown,
    })
}
