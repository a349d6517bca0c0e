use lifesync::db;
use lifesync::state::StateStore;
use tempfile::TempDir;

mod helpers;

#[test]
fn busy_timeout_is_set() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");

    let conn = db::open_database(&db_path).unwrap();

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
}

#[test]
fn garbage_file_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("state.db");
    std::fs::write(&db_path, vec![0xAB; 8192]).unwrap();

    assert!(db::open_database(&db_path).is_err());
}

#[tokio::test]
async fn second_handle_sees_ledger_writes() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("state.db");

    let writer = StateStore::new(db::open_database(&db_path).unwrap());
    let reader = StateStore::new(db::open_database(&db_path).unwrap());

    writer
        .upsert_pending(&helpers::record("rec-1", "2026-03-01T10:30:00Z"))
        .await
        .unwrap();

    assert!(reader.is_synced("rec-1").await.unwrap());
    assert_eq!(reader.sync_stats().await.unwrap().total_synced, 1);
}
