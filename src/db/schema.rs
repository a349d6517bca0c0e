//! SQL DDL for the sync state tables.
//!
//! Defines `sync_state` (the single watermark row), `synced_records` (the
//! dedup ledger), `sync_errors`, `sync_metrics` and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` so initialization can run on every start.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Watermark: exactly one row, id = 1
CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    last_sync_time TEXT,
    total_synced INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Dedup ledger, one row per source record
CREATE TABLE IF NOT EXISTS synced_records (
    record_id TEXT PRIMARY KEY,
    destination_id INTEGER,
    synced_at TEXT NOT NULL,
    title TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    processing_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(processing_status IN ('pending','processing','processed','failed','retry')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_synced_records_synced_at ON synced_records(synced_at);
CREATE INDEX IF NOT EXISTS idx_synced_records_status ON synced_records(processing_status);
CREATE INDEX IF NOT EXISTS idx_synced_records_start_time ON synced_records(start_time);

-- Append-only error log
CREATE TABLE IF NOT EXISTS sync_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_details TEXT,
    occurred_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_errors_occurred_at ON sync_errors(occurred_at);
CREATE INDEX IF NOT EXISTS idx_sync_errors_record_id ON sync_errors(record_id);

-- One row per pass
CREATE TABLE IF NOT EXISTS sync_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_started_at TEXT NOT NULL,
    sync_completed_at TEXT,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_successful INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    total_duration_seconds REAL,
    average_processing_time_ms REAL
);

CREATE INDEX IF NOT EXISTS idx_sync_metrics_started_at ON sync_metrics(sync_started_at);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables and the watermark row. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    // A fresh store has no watermark yet; the first pass uses the initial lookback.
    conn.execute(
        "INSERT OR IGNORE INTO sync_state (id, last_sync_time, total_synced, updated_at) \
         VALUES (1, NULL, 0, ?1)",
        [chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["sync_state", "synced_records", "sync_errors", "sync_metrics", "schema_meta"] {
            assert!(tables.contains(&table.to_string()), "{table} table missing");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_state", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1, "watermark row must stay unique");
    }

    #[test]
    fn status_check_constraint_rejects_unknown_values() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO synced_records (record_id, synced_at, title, start_time, end_time, processing_status, created_at) \
             VALUES ('r1', 'x', 't', 's', 'e', 'shipped', 'c')",
            [],
        );
        assert!(result.is_err());
    }
}
