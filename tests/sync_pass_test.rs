mod helpers;

use chrono::{DateTime, Utc};
use helpers::{
    destination_settings, mount_destination_ok, mount_source_page, orchestrator,
    orchestrator_settings, record_json, requests_to, single_lifelog, source_settings, test_store,
    RecordingNotifier,
};
use lifesync::client::{DestinationClient, SourceClient};
use lifesync::notify::Severity;
use lifesync::record::Record;
use lifesync::state::ProcessingStatus;
use lifesync::sync::SyncOrchestrator;
use lifesync::transform::{ContentProcessor, Transform, Transformed};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const T1: &str = "2026-03-01T10:30:00Z";
const T2: &str = "2026-03-01T11:30:00Z";
const T3: &str = "2026-03-01T12:30:00Z";

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn three_records() -> Vec<serde_json::Value> {
    vec![record_json("r1", T1), record_json("r2", T2), record_json("r3", T3)]
}

fn running() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn first_pass_delivers_everything_and_advances_watermark() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    mount_destination_ok(&destination, 500).await;

    let store = test_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut orch = orchestrator(store.clone(), &source, &destination, notifier.clone());

    let result = orch.run_pass(&running()).await.unwrap();
    assert_eq!(result.success_count, 3);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.total_processed, 3);
    assert!(!result.interrupted);

    for id in ["r1", "r2", "r3"] {
        let row = store.get_synced_record(id).await.unwrap().unwrap();
        assert_eq!(row.processing_status, ProcessingStatus::Processed);
        assert_eq!(row.destination_id, Some(500));
    }

    let watermark = store.watermark().await.unwrap();
    assert_eq!(watermark.last_sync_time, Some(ts(T3)));
    assert_eq!(watermark.total_synced, 3);

    let metrics = store.latest_completed_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.records_successful, 3);
    assert_eq!(metrics.records_failed, 0);

    assert_eq!(notifier.passes.lock().unwrap().len(), 1);
    assert!(notifier.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_record_is_counted_and_watermark_still_advances() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/memory"))
        .and(body_string_contains("Chat r2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 2})))
        .with_priority(1)
        .mount(&destination)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/memory/2/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"processing_status": "failed"})))
        .with_priority(1)
        .mount(&destination)
        .await;
    mount_destination_ok(&destination, 1).await;

    let store = test_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut orch = orchestrator(store.clone(), &source, &destination, notifier);

    let result = orch.run_pass(&running()).await.unwrap();
    assert_eq!(result.success_count, 2);
    assert_eq!(result.error_count, 1);
    assert!(result.has_errors());

    let failed = store.get_synced_record("r2").await.unwrap().unwrap();
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert!(failed.last_error.unwrap().contains("failed"));

    let errors = store.recent_errors(1).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, "ProcessingFailedError");
    assert_eq!(errors[0].record_id.as_deref(), Some("r2"));

    let watermark = store.watermark().await.unwrap();
    assert_eq!(watermark.last_sync_time, Some(ts(T3)));
    assert_eq!(watermark.total_synced, 2);
}

#[tokio::test]
async fn second_pass_skips_records_in_the_ledger() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    mount_destination_ok(&destination, 500).await;

    let store = test_store();
    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );

    orch.run_pass(&running()).await.unwrap();
    let second = orch.run_pass(&running()).await.unwrap();

    assert_eq!(second.total_processed, 0);
    assert_eq!(requests_to(&destination, "/api/v2/memory").await.len(), 3);
    assert_eq!(store.watermark().await.unwrap().total_synced, 3);
}

#[tokio::test]
async fn duplicate_ids_in_one_fetch_are_delivered_once() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, vec![record_json("r1", T1), record_json("r1", T2)]).await;
    mount_destination_ok(&destination, 500).await;

    let mut orch = orchestrator(
        test_store(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );
    let result = orch.run_pass(&running()).await.unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(requests_to(&destination, "/api/v2/memory").await.len(), 1);
}

#[tokio::test]
async fn empty_fetch_leaves_watermark_alone() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, vec![]).await;

    let store = test_store();
    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );
    let result = orch.run_pass(&running()).await.unwrap();

    assert_eq!(result.total_processed, 0);
    assert!(store.watermark().await.unwrap().last_sync_time.is_none());
    assert!(store.latest_completed_metrics().await.unwrap().is_some());
}

#[tokio::test]
async fn shutdown_stops_the_pass_without_moving_the_watermark() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    mount_destination_ok(&destination, 500).await;

    let store = test_store();
    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let result = orch.run_pass(&rx).await.unwrap();

    assert!(result.interrupted);
    assert_eq!(result.total_processed, 0);
    assert!(requests_to(&destination, "/api/v2/memory").await.is_empty());
    assert!(store.watermark().await.unwrap().last_sync_time.is_none());
    assert!(!store.is_synced("r1").await.unwrap());
}

#[tokio::test]
async fn rejected_destination_key_aborts_the_pass() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    Mock::given(method("POST"))
        .and(path("/api/v2/memory"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&destination)
        .await;

    let store = test_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut orch = orchestrator(store.clone(), &source, &destination, notifier.clone());

    let err = orch.run_pass(&running()).await.unwrap_err();
    assert!(err.is_authentication());
    assert_eq!(requests_to(&destination, "/api/v2/memory").await.len(), 1);

    let types: Vec<String> = store
        .recent_errors(1)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.error_type)
        .collect();
    assert!(types.contains(&"AuthenticationError".to_string()));
    assert!(types.contains(&"SyncPassError".to_string()));

    let metrics = store.latest_completed_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.records_processed, 3);
    assert_eq!(metrics.records_failed, 3);

    assert!(store.watermark().await.unwrap().last_sync_time.is_none());

    let alerts = notifier.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
}

#[tokio::test]
async fn source_outage_fails_the_pass() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/lifelogs"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&source)
        .await;

    let store = test_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut orch = orchestrator(store.clone(), &source, &destination, notifier.clone());

    assert!(orch.run_pass(&running()).await.is_err());
    assert_eq!(notifier.alert_titles(), vec!["Sync pass failed".to_string()]);
    assert!(notifier.passes.lock().unwrap().is_empty());

    let metrics = store.latest_completed_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.records_processed, 0);
}

#[tokio::test]
async fn retry_sweep_redelivers_failed_records() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, vec![record_json("r1", T1)]).await;
    Mock::given(method("GET"))
        .and(path("/v1/lifelogs/r1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(single_lifelog(record_json("r1", T1))))
        .mount(&source)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/memory"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&destination)
        .await;

    let store = test_store();
    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );

    let first = orch.run_pass(&running()).await.unwrap();
    assert_eq!(first.error_count, 1);
    assert_eq!(
        store.get_synced_record("r1").await.unwrap().unwrap().processing_status,
        ProcessingStatus::Failed
    );

    destination.reset().await;
    mount_destination_ok(&destination, 900).await;

    let sweep = orch.retry_failed(&running()).await.unwrap();
    assert_eq!(sweep.success_count, 1);

    let row = store.get_synced_record("r1").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Processed);
    assert_eq!(row.destination_id, Some(900));
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.is_none());

    let open_errors = store
        .recent_errors(1)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.resolved_at.is_none())
        .count();
    assert_eq!(open_errors, 0);

    let nothing_left = orch.retry_failed(&running()).await.unwrap();
    assert_eq!(nothing_left.total_processed, 0);
}

#[tokio::test]
async fn retry_sweep_marks_vanished_records_failed() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/lifelogs/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&source)
        .await;

    let store = test_store();
    store
        .upsert_pending(&Record::from_value(record_json("gone", T1)).unwrap())
        .await
        .unwrap();
    store
        .update_status("gone", ProcessingStatus::Failed, None, Some("503"))
        .await
        .unwrap();

    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );
    let sweep = orch.retry_failed(&running()).await.unwrap();
    assert_eq!(sweep.error_count, 1);

    let row = store.get_synced_record("gone").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("record no longer exists at source"));
}

struct Flaky;

impl Transform for Flaky {
    fn transform(&self, record: &Record) -> anyhow::Result<Transformed> {
        match record.id.as_str() {
            "r1" => anyhow::bail!("unsupported content"),
            "r2" => panic!("renderer bug"),
            _ => ContentProcessor::new().transform(record),
        }
    }
}

#[tokio::test]
async fn transform_errors_and_panics_fail_only_that_record() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    mount_destination_ok(&destination, 500).await;

    let store = test_store();
    let mut orch = SyncOrchestrator::new(
        store.clone(),
        Arc::new(SourceClient::new(source_settings(&source.uri())).unwrap()),
        Arc::new(DestinationClient::new(destination_settings(&destination.uri())).unwrap()),
        Arc::new(Flaky),
        Arc::new(RecordingNotifier::default()),
        orchestrator_settings(),
    );

    let result = orch.run_pass(&running()).await.unwrap();
    assert_eq!(result.success_count, 1);
    assert_eq!(result.error_count, 2);

    let errors = store.recent_errors(1).await.unwrap();
    assert!(errors.iter().all(|e| e.error_type == "TransformError"));
    assert_eq!(requests_to(&destination, "/api/v2/memory").await.len(), 1);
}

#[tokio::test]
async fn retry_sweep_recovers_a_row_left_processing() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, vec![record_json("r1", T1)]).await;
    Mock::given(method("GET"))
        .and(path("/v1/lifelogs/r1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(single_lifelog(record_json("r1", T1))))
        .mount(&source)
        .await;
    mount_destination_ok(&destination, 610).await;

    let store = test_store();
    store
        .upsert_pending(&Record::from_value(record_json("r1", T1)).unwrap())
        .await
        .unwrap();
    store
        .update_status("r1", ProcessingStatus::Processing, None, None)
        .await
        .unwrap();

    let mut orch = orchestrator(
        store.clone(),
        &source,
        &destination,
        Arc::new(RecordingNotifier::default()),
    );

    let pass = orch.run_pass(&running()).await.unwrap();
    assert_eq!(pass.total_processed, 0, "ledger row still blocks the pass");

    let sweep = orch.retry_failed(&running()).await.unwrap();
    assert_eq!(sweep.success_count, 1);

    let row = store.get_synced_record("r1").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Processed);
    assert_eq!(row.destination_id, Some(610));
    assert_eq!(requests_to(&destination, "/api/v2/memory").await.len(), 1);

    let again = orch.retry_failed(&running()).await.unwrap();
    assert_eq!(again.total_processed, 0);
}

/// Deletes the ledger row for `r1` mid-delivery so the following status
/// write fails.
struct RowRemover {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl Transform for RowRemover {
    fn transform(&self, record: &Record) -> anyhow::Result<Transformed> {
        if record.id == "r1" {
            self.conn
                .lock()
                .unwrap()
                .execute("DELETE FROM synced_records WHERE record_id = 'r1'", [])?;
        }
        ContentProcessor::new().transform(record)
    }
}

#[tokio::test]
async fn state_write_failure_fails_only_that_record() {
    let source = MockServer::start().await;
    let destination = MockServer::start().await;
    mount_source_page(&source, three_records()).await;
    mount_destination_ok(&destination, 700).await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = lifesync::state::StateStore::new(lifesync::db::open_database(&db_path).unwrap());
    let remover = RowRemover {
        conn: std::sync::Mutex::new(lifesync::db::open_database(&db_path).unwrap()),
    };

    let mut orch = SyncOrchestrator::new(
        store.clone(),
        Arc::new(SourceClient::new(source_settings(&source.uri())).unwrap()),
        Arc::new(DestinationClient::new(destination_settings(&destination.uri())).unwrap()),
        Arc::new(remover),
        Arc::new(RecordingNotifier::default()),
        orchestrator_settings(),
    );

    let result = orch.run_pass(&running()).await.unwrap();
    assert_eq!(result.success_count, 2);
    assert_eq!(result.error_count, 1);
    assert!(!result.interrupted);

    for id in ["r2", "r3"] {
        let row = store.get_synced_record(id).await.unwrap().unwrap();
        assert_eq!(row.processing_status, ProcessingStatus::Processed);
    }

    let errors = store.recent_errors(1).await.unwrap();
    assert!(errors
        .iter()
        .any(|e| e.error_type == "StateError" && e.record_id.as_deref() == Some("r1")));
    assert_eq!(store.watermark().await.unwrap().last_sync_time, Some(ts(T3)));
}
