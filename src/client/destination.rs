//! Destination memory-store API client.
//!
//! Creating a record is a two-step exchange: `POST /api/v2/memory` returns an
//! id immediately, then processing completes asynchronously and is observed
//! by polling `GET /api/v2/memory/{id}/status` at a fixed interval.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use super::{build_http_client, check_status, read_json, transport_error, ApiError};
use crate::config::DestinationConfig;
use crate::resilience::{CircuitBreaker, CircuitConfig, CircuitStats};

const SERVICE: &str = "destination";
const SOURCE_TYPE: &str = "application_plugin";

/// Connection, polling and breaker settings for [`DestinationClient`].
#[derive(Debug, Clone)]
pub struct DestinationSettings {
    pub base_url: String,
    pub api_key: String,
    pub bucket: String,
    pub max_poll_attempts: u32,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub breaker: CircuitConfig,
}

impl DestinationSettings {
    pub fn from_config(config: &DestinationConfig) -> Self {
        Self {
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            bucket: config.bucket.clone(),
            max_poll_attempts: config.max_poll_attempts,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            breaker: CircuitConfig {
                failure_threshold: config.breaker_failure_threshold,
                recovery_timeout: Duration::from_secs(config.breaker_recovery_secs),
            },
        }
    }
}

/// How a created record finished processing on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The destination reported `processed`.
    Processed(i64),
    /// The destination reported `failed`.
    Failed(i64),
    /// The poll budget ran out before a terminal status.
    TimedOut(i64),
}

impl CreateOutcome {
    /// The assigned id, only when processing succeeded.
    pub fn destination_id(&self) -> Option<i64> {
        match self {
            Self::Processed(id) => Some(*id),
            Self::Failed(_) | Self::TimedOut(_) => None,
        }
    }

    /// Human-readable reason for a soft failure.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Processed(_) => None,
            Self::Failed(id) => Some(format!("destination processing failed for memory {id}")),
            Self::TimedOut(id) => Some(format!("destination processing timed out for memory {id}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DestinationStats {
    pub bucket: String,
    pub circuit: CircuitStats,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    processing_status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BucketList {
    #[serde(default)]
    items: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    name: Option<String>,
}

enum PollStatus {
    Processed,
    Failed,
    InProgress,
}

pub struct DestinationClient {
    http: reqwest::Client,
    settings: DestinationSettings,
    breaker: CircuitBreaker,
}

impl DestinationClient {
    pub fn new(settings: DestinationSettings) -> Result<Self> {
        let http = build_http_client(settings.connect_timeout, settings.request_timeout)
            .context("failed to build destination HTTP client")?;
        let breaker = CircuitBreaker::new(SERVICE, settings.breaker.clone());
        Ok(Self {
            http,
            settings,
            breaker,
        })
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Create a record in the configured bucket and wait for processing.
    ///
    /// Errors are reserved for the create request itself and for credential
    /// failures while polling. A `failed` status or an exhausted poll budget
    /// comes back as a soft [`CreateOutcome`].
    pub async fn create_record(
        &self,
        content: &str,
        reference: &serde_json::Value,
    ) -> Result<CreateOutcome, ApiError> {
        let id = self.submit(content, reference).await?;
        tracing::info!(memory_id = id, "created destination record");

        let outcome = self.poll_until_done(id).await?;
        match outcome {
            CreateOutcome::Processed(_) => {
                tracing::info!(memory_id = id, "destination record processed");
            }
            CreateOutcome::Failed(_) => {
                tracing::error!(memory_id = id, "destination processing failed");
            }
            CreateOutcome::TimedOut(_) => {
                tracing::warn!(
                    memory_id = id,
                    attempts = self.settings.max_poll_attempts,
                    "destination polling timed out"
                );
            }
        }
        Ok(outcome)
    }

    /// Get-or-create a named bucket. Returns `true` when it had to be created.
    pub async fn ensure_storage_target(&self, name: &str) -> Result<bool, ApiError> {
        let buckets = self.list_buckets().await?;
        if buckets.iter().any(|b| b.name.as_deref() == Some(name)) {
            tracing::debug!(bucket = name, "bucket exists");
            return Ok(false);
        }

        tracing::info!(bucket = name, "creating bucket");
        let url = self.url("/api/v2/buckets");
        self.guarded(|| async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.settings.api_key)
                .query(&[("bucket_name", name)])
                .send()
                .await
                .map_err(|e| transport_error(SERVICE, e))?;
            check_status(SERVICE, response).await?;
            Ok(())
        })
        .await?;
        Ok(true)
    }

    /// List buckets to check credentials and reachability.
    pub async fn test_connection(&self) -> Result<(), ApiError> {
        self.list_buckets().await?;
        tracing::info!("destination API connection ok");
        Ok(())
    }

    pub fn stats(&self) -> DestinationStats {
        DestinationStats {
            bucket: self.settings.bucket.clone(),
            circuit: self.breaker.stats(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn submit(&self, content: &str, reference: &serde_json::Value) -> Result<i64, ApiError> {
        let url = self.url("/api/v2/memory");
        let payload = json!({
            "raw_content": content,
            "bucketId": self.settings.bucket,
            "source_type": SOURCE_TYPE,
            "reference_data": reference,
        });

        let created: CreateResponse = self
            .guarded(|| async {
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.settings.api_key)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| transport_error(SERVICE, e))?;
                let response = check_status(SERVICE, response).await?;
                read_json(SERVICE, response).await
            })
            .await?;

        created
            .id
            .as_ref()
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| ApiError::InvalidResponse {
                service: SERVICE,
                message: "create response has no id".to_string(),
            })
    }

    async fn poll_until_done(&self, id: i64) -> Result<CreateOutcome, ApiError> {
        let attempts = self.settings.max_poll_attempts.max(1);

        for attempt in 1..=attempts {
            match self.fetch_status(id).await {
                Ok(PollStatus::Processed) => return Ok(CreateOutcome::Processed(id)),
                Ok(PollStatus::Failed) => return Ok(CreateOutcome::Failed(id)),
                Ok(PollStatus::InProgress) => {
                    tracing::debug!(memory_id = id, attempt, "destination still processing");
                }
                Err(e) if e.is_authentication() => return Err(e),
                Err(e) => {
                    tracing::warn!(memory_id = id, attempt, error = %e, "status poll failed");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        Ok(CreateOutcome::TimedOut(id))
    }

    async fn fetch_status(&self, id: i64) -> Result<PollStatus, ApiError> {
        let url = self.url(&format!("/api/v2/memory/{id}/status"));
        let body: StatusResponse = self
            .guarded(|| async {
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.settings.api_key)
                    .send()
                    .await
                    .map_err(|e| transport_error(SERVICE, e))?;
                let response = check_status(SERVICE, response).await?;
                read_json(SERVICE, response).await
            })
            .await?;

        Ok(match body.processing_status.as_deref() {
            Some("processed") => PollStatus::Processed,
            Some("failed") => PollStatus::Failed,
            Some("pending") | Some("processing") => PollStatus::InProgress,
            other => {
                tracing::warn!(memory_id = id, status = ?other, "unrecognized processing status");
                PollStatus::InProgress
            }
        })
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>, ApiError> {
        let url = self.url("/api/v2/buckets");
        let list: BucketList = self
            .guarded(|| async {
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.settings.api_key)
                    .send()
                    .await
                    .map_err(|e| transport_error(SERVICE, e))?;
                let response = check_status(SERVICE, response).await?;
                read_json(SERVICE, response).await
            })
            .await?;
        Ok(list.items)
    }

    async fn guarded<F, Fut, T>(&self, request: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.breaker
            .call(request)
            .await
            .map_err(|e| ApiError::from_circuit(SERVICE, e))
    }
}
