//! One sync pass, start to finish.
//!
//! A pass moves through: read watermark → fetch candidates → drop ids already
//! in the ledger → process each (pending → processing → processed | failed)
//! → advance watermark → record metrics.
//!
//! [`SyncOrchestrator::run_pass`] and [`SyncOrchestrator::retry_failed`]
//! take `&mut self`, so with a single owner two passes can never overlap.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::{PassError, SyncResult};
use crate::client::{ApiError, CreateOutcome, DestinationClient, Direction, FetchQuery, SourceClient};
use crate::config::SyncConfig;
use crate::notify::{Alert, Notifier, Severity};
use crate::record::Record;
use crate::state::{NewSyncError, ProcessingStatus, StateError, StateStore};
use crate::transform::Transform;

/// Pass-level tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Subtracted from the watermark when computing the fetch window.
    pub watermark_buffer: chrono::Duration,
    /// Window start for the very first pass, counted back from now.
    pub initial_lookback: chrono::Duration,
    /// Retry sweeps skip records that have been retried this many times.
    pub max_retries: u32,
    /// Pause between records within a pass.
    pub record_delay: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            watermark_buffer: chrono::Duration::minutes(config.watermark_buffer_minutes),
            initial_lookback: chrono::Duration::hours(config.initial_lookback_hours),
            max_retries: config.max_retries,
            record_delay: Duration::from_millis(500),
        }
    }
}

/// Why a single record did not make it to the destination.
#[derive(Debug)]
enum DeliveryError {
    Transform(anyhow::Error),
    Api(ApiError),
    Soft(CreateOutcome),
    State(StateError),
}

impl From<StateError> for DeliveryError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

impl DeliveryError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Transform(_) => "TransformError",
            Self::Api(ApiError::Authentication { .. }) => "AuthenticationError",
            Self::Api(ApiError::CircuitOpen { .. }) => "CircuitOpenError",
            Self::Api(_) => "DestinationError",
            Self::Soft(CreateOutcome::TimedOut(_)) => "ProcessingTimeoutError",
            Self::Soft(_) => "ProcessingFailedError",
            Self::State(_) => "StateError",
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform(e) => write!(f, "transform failed: {e:#}"),
            Self::Api(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "state store write failed: {e}"),
            Self::Soft(outcome) => f.write_str(
                &outcome
                    .failure_reason()
                    .unwrap_or_else(|| "destination processing failed".to_string()),
            ),
        }
    }
}

pub struct SyncOrchestrator {
    store: StateStore,
    source: Arc<SourceClient>,
    destination: Arc<DestinationClient>,
    transform: Arc<dyn Transform>,
    notifier: Arc<dyn Notifier>,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: StateStore,
        source: Arc<SourceClient>,
        destination: Arc<DestinationClient>,
        transform: Arc<dyn Transform>,
        notifier: Arc<dyn Notifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            source,
            destination,
            transform,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one pass.
    ///
    /// Record-level failures are counted and the pass continues. Anything
    /// else (fetch failure, state store failure, rejected destination
    /// credentials) ends the pass: the metrics row is closed with every
    /// unfinished candidate counted as failed, a `SyncPassError` row is
    /// logged, an alert goes out, and the error is returned.
    ///
    /// `shutdown` is checked between records. A pass stopped by shutdown
    /// finishes its current record, closes its metrics row, and leaves the
    /// watermark where it was.
    pub async fn run_pass(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncResult, PassError> {
        let sync_id = uuid::Uuid::now_v7().to_string();
        let started = Instant::now();
        let metrics_id = self.store.start_metrics(Utc::now()).await?;
        tracing::info!(sync_id = %sync_id, "sync pass started");

        let mut result = SyncResult::new(sync_id);
        let mut candidates = 0u64;
        let outcome = self.execute_pass(&mut result, &mut candidates, shutdown).await;
        result.duration_seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                self.store
                    .finish_metrics(
                        metrics_id,
                        result.total_processed,
                        result.success_count,
                        result.error_count,
                    )
                    .await?;
                tracing::info!(
                    sync_id = %result.sync_id,
                    succeeded = result.success_count,
                    processed = result.total_processed,
                    interrupted = result.interrupted,
                    duration_secs = result.duration_seconds,
                    "sync pass complete"
                );
                self.notifier.report_pass(&result).await;
                Ok(result)
            }
            Err(err) => {
                self.fail_pass(metrics_id, &mut result, candidates, &err).await;
                Err(err)
            }
        }
    }

    async fn execute_pass(
        &self,
        result: &mut SyncResult,
        candidates: &mut u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PassError> {
        let window_start = self.window_start().await?;
        let query = FetchQuery {
            start: Some(window_start),
            direction: Direction::Asc,
            ..FetchQuery::default()
        };

        let fetched: Vec<Record> = self.source.fetch(query).try_collect().await?;
        let newest = fetched.iter().map(|r| r.updated_at).max();

        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(fetched.len());
        for record in fetched {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            if self.store.is_synced(&record.id).await? {
                tracing::debug!(record_id = %record.id, "already in ledger, skipping");
                continue;
            }
            fresh.push(record);
        }
        *candidates = fresh.len() as u64;
        tracing::info!(
            window_start = %window_start,
            fetched = seen.len(),
            new = fresh.len(),
            "candidates selected"
        );

        for (index, record) in fresh.iter().enumerate() {
            if *shutdown.borrow() {
                tracing::info!(remaining = fresh.len() - index, "shutdown requested, stopping pass");
                result.interrupted = true;
                break;
            }
            if index > 0 && !self.settings.record_delay.is_zero() {
                tokio::time::sleep(self.settings.record_delay).await;
            }
            self.process_record(record, result).await?;
        }

        if !result.interrupted {
            if let Some(newest) = newest {
                self.store
                    .advance_watermark(newest, result.success_count)
                    .await?;
            }
        }
        Ok(())
    }

    async fn window_start(&self) -> Result<DateTime<Utc>, PassError> {
        let watermark = self.store.watermark().await?;
        Ok(match watermark.last_sync_time {
            Some(last) => last - self.settings.watermark_buffer,
            None => Utc::now() - self.settings.initial_lookback,
        })
    }

    /// Deliver one record and record the outcome.
    ///
    /// Only a failure to create the ledger row and rejected destination
    /// credentials are returned as errors. Every later failure, including a
    /// state store write, is counted in `result` and marked on the row as
    /// far as the store allows.
    async fn process_record(
        &self,
        record: &Record,
        result: &mut SyncResult,
    ) -> Result<(), PassError> {
        tracing::debug!(record_id = %record.id, title = %record.title, "processing record");
        self.store.upsert_pending(record).await?;

        match self.deliver_tracked(record).await {
            Ok(destination_id) => {
                if let Err(e) = self.store.resolve_record_errors(&record.id).await {
                    tracing::warn!(record_id = %record.id, error = %e, "could not resolve record errors");
                }
                result.record_success();
                tracing::info!(record_id = %record.id, destination_id, "record synced");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(record_id = %record.id, error = %message, "record failed");
                self.mark_failed(record, &err, &message).await;
                result.record_failure(format!("{}: {message}", record.id));

                match err {
                    DeliveryError::Api(api) if api.is_authentication() => Err(api.into()),
                    _ => Ok(()),
                }
            }
        }
    }

    async fn deliver_tracked(&self, record: &Record) -> Result<i64, DeliveryError> {
        self.store
            .update_status(&record.id, ProcessingStatus::Processing, None, None)
            .await?;
        let destination_id = self.deliver(record).await?;
        self.store
            .update_status(
                &record.id,
                ProcessingStatus::Processed,
                Some(destination_id),
                None,
            )
            .await?;
        Ok(destination_id)
    }

    async fn mark_failed(&self, record: &Record, err: &DeliveryError, message: &str) {
        let marked = self
            .store
            .update_status(&record.id, ProcessingStatus::Failed, None, Some(message))
            .await;
        if let Err(e) = marked {
            tracing::warn!(record_id = %record.id, error = %e, "could not mark record failed");
        }

        let logged = self
            .store
            .log_error(
                NewSyncError::new(err.error_type(), message.to_string())
                    .for_record(record.id.clone())
                    .with_details(format!("{err:?}")),
            )
            .await;
        if let Err(e) = logged {
            tracing::warn!(record_id = %record.id, error = %e, "could not record error");
        }
    }

    async fn deliver(&self, record: &Record) -> Result<i64, DeliveryError> {
        let transform = Arc::clone(&self.transform);
        let transformed = std::panic::catch_unwind(AssertUnwindSafe(|| transform.transform(record)))
            .map_err(|_| DeliveryError::Transform(anyhow::anyhow!("transform panicked")))?
            .map_err(DeliveryError::Transform)?;

        let outcome = self
            .destination
            .create_record(&transformed.content, &transformed.reference)
            .await
            .map_err(DeliveryError::Api)?;

        outcome.destination_id().ok_or(DeliveryError::Soft(outcome))
    }

    /// Reprocess records left `failed` or `retry` below the retry limit,
    /// plus any row an interrupted delivery left `pending` or `processing`.
    ///
    /// Each attempt moves the record to `retry` (incrementing its counter),
    /// re-fetches it from the source and delivers it again. A record the
    /// source no longer has is marked failed.
    pub async fn retry_failed(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncResult, PassError> {
        let started = Instant::now();
        let sweep_start = Utc::now();
        let mut result = SyncResult::new(uuid::Uuid::now_v7().to_string());

        let stranded = self.store.stranded_records(sweep_start).await?;
        if !stranded.is_empty() {
            tracing::warn!(count = stranded.len(), "recovering records left mid-delivery");
        }
        let mut rows = self
            .store
            .retryable_records(self.settings.max_retries)
            .await?;
        rows.extend(stranded);
        if rows.is_empty() {
            return Ok(result);
        }
        tracing::info!(count = rows.len(), "retrying failed records");

        for row in rows {
            if *shutdown.borrow() {
                result.interrupted = true;
                break;
            }
            let id = row.record_id;
            self.store
                .update_status(&id, ProcessingStatus::Retry, None, None)
                .await?;

            match self.source.get_by_id(&id).await {
                Ok(Some(record)) => self.process_record(&record, &mut result).await?,
                Ok(None) => {
                    let message = "record no longer exists at source";
                    tracing::warn!(record_id = %id, "{message}");
                    self.store
                        .update_status(&id, ProcessingStatus::Failed, None, Some(message))
                        .await?;
                    result.record_failure(format!("{id}: {message}"));
                }
                Err(e) if e.is_authentication() => return Err(e.into()),
                Err(e) => {
                    let message = format!("re-fetch failed: {e}");
                    tracing::warn!(record_id = %id, error = %e, "re-fetch failed");
                    self.store
                        .update_status(&id, ProcessingStatus::Failed, None, Some(&message))
                        .await?;
                    result.record_failure(format!("{id}: {message}"));
                }
            }
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            succeeded = result.success_count,
            failed = result.error_count,
            "retry sweep complete"
        );
        Ok(result)
    }

    async fn fail_pass(
        &self,
        metrics_id: i64,
        result: &mut SyncResult,
        candidates: u64,
        err: &PassError,
    ) {
        let processed = candidates.max(result.total_processed);
        let failed = processed - result.success_count;
        result.errors.push(format!("sync pass failed: {err}"));
        tracing::error!(sync_id = %result.sync_id, error = %err, "sync pass failed");

        if let Err(e) = self
            .store
            .finish_metrics(metrics_id, processed, result.success_count, failed)
            .await
        {
            tracing::warn!(error = %e, "could not finalize pass metrics");
        }
        let logged = self
            .store
            .log_error(
                NewSyncError::new("SyncPassError", err.to_string())
                    .with_details(format!("sync_id={} {err:?}", result.sync_id)),
            )
            .await;
        if let Err(e) = logged {
            tracing::warn!(error = %e, "could not record pass error");
        }

        self.notifier
            .alert(&Alert::new(
                Severity::Critical,
                "Sync pass failed",
                format!(
                    "Pass {} stopped after {} of {} records: {err}",
                    result.sync_id, result.total_processed, candidates
                ),
            ))
            .await;
    }
}
