//! Health checks and the HTTP health server.
//!
//! Four checks feed the full verdict: the state store answers `SELECT 1`, the
//! configuration validates, the last completed pass is recent enough, and the
//! filesystem holding the state database has room left. `/health` runs all of
//! them, `/ready` only the store and configuration, and `/live` only proves the
//! process is serving. Unhealthy responses use 503.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::config::LifesyncConfig;
use crate::notify::{Alert, Notifier, Severity};
use crate::state::{StateStore, SyncStats};

/// Free space below this on the state database's filesystem fails health.
pub const MIN_FREE_DISK_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub healthy: bool,
    pub message: String,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<&'static str, CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SyncStats>,
}

impl HealthReport {
    fn from_checks(checks: BTreeMap<&'static str, CheckResult>) -> Self {
        Self {
            healthy: checks.values().all(|c| c.healthy),
            timestamp: Utc::now(),
            checks,
            stats: None,
        }
    }
}

/// Runs health checks against the live store and configuration.
#[derive(Clone)]
pub struct HealthChecker {
    store: StateStore,
    config: Arc<LifesyncConfig>,
}

impl HealthChecker {
    pub fn new(store: StateStore, config: Arc<LifesyncConfig>) -> Self {
        Self { store, config }
    }

    async fn check_store(&self) -> CheckResult {
        match self.store.ping().await {
            Ok(()) => CheckResult::ok("state store reachable"),
            Err(e) => CheckResult::fail(format!("state store error: {e}")),
        }
    }

    fn check_config(&self) -> CheckResult {
        match self.config.validate() {
            Ok(()) => CheckResult::ok("configuration valid"),
            Err(e) => CheckResult::fail(format!("configuration invalid: {e:#}")),
        }
    }

    async fn check_staleness(&self) -> CheckResult {
        let limit = chrono::Duration::minutes(self.config.sync.stale_after_minutes);
        match self.store.latest_completed_metrics().await {
            Ok(Some(metrics)) => {
                let Some(completed) = metrics.sync_completed_at else {
                    return CheckResult::fail("last pass has no completion time");
                };
                let age = Utc::now() - completed;
                if age > limit {
                    CheckResult::fail(format!(
                        "last completed pass was {} minutes ago",
                        age.num_minutes()
                    ))
                } else {
                    CheckResult::ok(format!("last pass completed at {completed}"))
                }
            }
            Ok(None) => CheckResult::fail("no completed sync pass yet"),
            Err(e) => CheckResult::fail(format!("could not read pass metrics: {e}")),
        }
    }

    fn check_disk(&self) -> CheckResult {
        check_disk_space(&self.config.resolved_db_path(), MIN_FREE_DISK_BYTES)
    }

    /// Store, configuration, staleness and disk space.
    pub async fn health(&self) -> HealthReport {
        HealthReport::from_checks(BTreeMap::from([
            ("database", self.check_store().await),
            ("configuration", self.check_config()),
            ("sync_freshness", self.check_staleness().await),
            ("disk_space", self.check_disk()),
        ]))
    }

    /// [`Self::health`] plus sync statistics.
    pub async fn detailed(&self) -> HealthReport {
        let mut report = self.health().await;
        report.stats = self.store.sync_stats().await.ok();
        report
    }

    /// Store and configuration only.
    pub async fn readiness(&self) -> HealthReport {
        HealthReport::from_checks(BTreeMap::from([
            ("database", self.check_store().await),
            ("configuration", self.check_config()),
        ]))
    }
}

/// Free space on the filesystem holding `db_path`.
///
/// Measured at the nearest existing ancestor, so a database that has not been
/// created yet still gets a reading. An unreadable filesystem passes.
fn check_disk_space(db_path: &Path, min_free: u64) -> CheckResult {
    let Some(dir) = db_path.ancestors().skip(1).find(|p| p.is_dir()) else {
        return CheckResult::ok("disk space not measurable");
    };

    match fs2::available_space(dir) {
        Ok(free) if free >= min_free => {
            CheckResult::ok(format!("{} MiB free at {}", free / (1024 * 1024), dir.display()))
        }
        Ok(free) => CheckResult::fail(format!(
            "only {} MiB free at {}",
            free / (1024 * 1024),
            dir.display()
        )),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "disk space check unavailable");
            CheckResult::ok("disk space not measurable")
        }
    }
}

/// Remembers the last verdict and alerts when it flips.
pub struct HealthMonitor {
    checker: HealthChecker,
    notifier: Arc<dyn Notifier>,
    last_healthy: Mutex<Option<bool>>,
}

impl HealthMonitor {
    pub fn new(checker: HealthChecker, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            checker,
            notifier,
            last_healthy: Mutex::new(None),
        }
    }

    /// Run the full check and alert on a healthy ↔ unhealthy transition.
    /// The first observation only sets the baseline. Returns the verdict.
    pub async fn check_and_alert(&self) -> bool {
        let report = self.checker.health().await;
        let previous = {
            let mut last = self
                .last_healthy
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.replace(report.healthy)
        };

        match previous {
            Some(was) if was != report.healthy => {
                let alert = if report.healthy {
                    Alert::new(Severity::Info, "System recovered", "All health checks pass again.")
                } else {
                    let failing = report
                        .checks
                        .iter()
                        .filter(|(_, c)| !c.healthy)
                        .map(|(name, c)| format!("{name}: {}", c.message))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Alert::new(Severity::Critical, "Health check failing", failing)
                };
                tracing::warn!(healthy = report.healthy, "health state changed");
                self.notifier.alert(&alert).await;
            }
            _ => {}
        }
        report.healthy
    }
}

fn respond(report: HealthReport) -> impl IntoResponse {
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn health(State(checker): State<HealthChecker>) -> impl IntoResponse {
    respond(checker.health().await)
}

async fn health_detailed(State(checker): State<HealthChecker>) -> impl IntoResponse {
    respond(checker.detailed().await)
}

async fn ready(State(checker): State<HealthChecker>) -> impl IntoResponse {
    respond(checker.readiness().await)
}

async fn live() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive", "timestamp": Utc::now() }))
}

pub fn router(checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/ready", get(ready))
        .route("/live", get(live))
        .with_state(checker)
}

/// Serve the health routes until `shutdown` flips to `true`.
pub async fn serve(
    checker: HealthChecker,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "health server listening");

    axum::serve(listener, router(checker))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
