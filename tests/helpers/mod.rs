#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lifesync::client::{DestinationClient, DestinationSettings, SourceClient, SourceSettings};
use lifesync::db;
use lifesync::notify::{Alert, Notifier};
use lifesync::record::Record;
use lifesync::resilience::{CircuitConfig, RetryConfig};
use lifesync::state::StateStore;
use lifesync::sync::{OrchestratorSettings, SyncOrchestrator, SyncResult};
use lifesync::transform::ContentProcessor;

/// A fresh in-memory state store with schema and migrations applied.
pub fn test_store() -> StateStore {
    StateStore::new(db::open_memory_database().unwrap())
}

/// Raw source JSON for a short two-speaker conversation.
pub fn record_json(id: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "title": format!("Chat {id}"),
        "markdown": "# Chat",
        "startTime": "2026-03-01T10:00:00Z",
        "endTime": "2026-03-01T10:20:00Z",
        "isStarred": false,
        "updatedAt": updated_at,
        "contents": [
            {"type": "heading1", "content": format!("Chat {id}"), "children": []},
            {
                "type": "blockquote",
                "content": "Morning, how did the demo go?",
                "speakerName": "You",
                "speakerIdentifier": "user",
                "startTime": "2026-03-01T10:00:05Z"
            },
            {
                "type": "blockquote",
                "content": "Went well, they want a follow-up next week.",
                "speakerName": "Sam",
                "startTime": "2026-03-01T10:00:12Z"
            }
        ]
    })
}

pub fn record(id: &str, updated_at: &str) -> Record {
    Record::from_value(record_json(id, updated_at)).unwrap()
}

/// One page of the source listing envelope.
pub fn lifelog_page(records: Vec<Value>, next_cursor: Option<&str>) -> Value {
    json!({
        "data": {"lifelogs": records},
        "meta": {"lifelogs": {"nextCursor": next_cursor, "count": 0}}
    })
}

pub fn single_lifelog(record: Value) -> Value {
    json!({"data": {"lifelog": record}})
}

pub fn source_settings(base_url: &str) -> SourceSettings {
    SourceSettings {
        base_url: base_url.to_string(),
        api_key: "source-key".to_string(),
        timezone: "UTC".to_string(),
        batch_size: 10,
        requests_per_minute: 6000,
        burst_capacity: 100,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        retry: RetryConfig::fast(3),
        breaker: CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        },
    }
}

pub fn destination_settings(base_url: &str) -> DestinationSettings {
    DestinationSettings {
        base_url: base_url.to_string(),
        api_key: "dest-key".to_string(),
        bucket: "lifelogs".to_string(),
        max_poll_attempts: 3,
        poll_interval: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        breaker: CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        },
    }
}

pub fn orchestrator_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        watermark_buffer: chrono::Duration::minutes(5),
        initial_lookback: chrono::Duration::hours(24),
        max_retries: 3,
        record_delay: Duration::ZERO,
    }
}

/// Collects everything sent through it.
#[derive(Default)]
pub struct RecordingNotifier {
    pub passes: Mutex<Vec<SyncResult>>,
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alert_titles(&self) -> Vec<String> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.title.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn report_pass(&self, result: &SyncResult) {
        self.passes.lock().unwrap().push(result.clone());
    }

    async fn alert(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

/// Wire an orchestrator against two mock servers.
pub fn orchestrator(
    store: StateStore,
    source: &MockServer,
    destination: &MockServer,
    notifier: Arc<RecordingNotifier>,
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        store,
        Arc::new(SourceClient::new(source_settings(&source.uri())).unwrap()),
        Arc::new(DestinationClient::new(destination_settings(&destination.uri())).unwrap()),
        Arc::new(ContentProcessor::new()),
        notifier,
        orchestrator_settings(),
    )
}

/// Serve a single listing page containing `records`.
pub async fn mount_source_page(server: &MockServer, records: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/v1/lifelogs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lifelog_page(records, None)))
        .mount(server)
        .await;
}

/// Accept every create with id `memory_id` and report it processed on first poll.
pub async fn mount_destination_ok(server: &MockServer, memory_id: i64) {
    Mock::given(method("POST"))
        .and(path("/api/v2/memory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": memory_id})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/v2/memory/\d+/status$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"processing_status": "processed"})),
        )
        .mount(server)
        .await;
}

/// Requests received by `server` whose path matches `path` exactly.
pub async fn requests_to(server: &MockServer, path: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == path)
        .collect()
}
