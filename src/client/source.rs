//! Source lifelog API client.
//!
//! Pages through `GET /v1/lifelogs` with cursor tokens, yielding parsed
//! [`Record`]s as a lazy stream. Every page request takes a token from the
//! shared [`AdaptiveRateLimiter`], runs inside the [`CircuitBreaker`] and is
//! retried with backoff on transient failures.

use anyhow::{Context, Result};
use async_stream::try_stream;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{build_http_client, check_status, read_json, transport_error, ApiError};
use crate::config::SourceConfig;
use crate::record::Record;
use crate::resilience::{
    retry, AdaptiveRateLimiter, CircuitBreaker, CircuitConfig, CircuitStats, RateLimiterStats,
    RetryConfig,
};

const SERVICE: &str = "source";

/// Server-enforced maximum page size.
pub const MAX_PAGE_SIZE: u32 = 10;

/// Connection and resilience settings for [`SourceClient`].
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub api_key: String,
    pub timezone: String,
    pub batch_size: u32,
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: CircuitConfig,
}

impl SourceSettings {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            timezone: config.timezone.clone(),
            batch_size: config.batch_size,
            requests_per_minute: config.requests_per_minute,
            burst_capacity: config.burst_capacity,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            retry: RetryConfig::request(config.max_attempts),
            breaker: CircuitConfig {
                failure_threshold: config.breaker_failure_threshold,
                recovery_timeout: Duration::from_secs(config.breaker_recovery_secs),
            },
        }
    }
}

/// Sort order of the listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Filters for [`SourceClient::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Overall cap across all pages. `None` fetches until the cursor runs out.
    pub limit: Option<usize>,
    pub starred_only: bool,
    pub direction: Direction,
}

#[derive(Debug, Serialize)]
pub struct SourceStats {
    pub rate_limiter: RateLimiterStats,
    pub circuit: CircuitStats,
}

#[derive(Debug, Default, Deserialize)]
struct ListEnvelope {
    data: Option<ListData>,
    meta: Option<ListMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct ListData {
    lifelogs: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    lifelogs: Option<CursorMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorMeta {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SingleEnvelope {
    data: Option<SingleData>,
}

#[derive(Debug, Deserialize)]
struct SingleData {
    lifelog: Option<serde_json::Value>,
}

struct Page {
    records: Vec<serde_json::Value>,
    next_cursor: Option<String>,
}

pub struct SourceClient {
    http: reqwest::Client,
    settings: SourceSettings,
    limiter: Arc<AdaptiveRateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl SourceClient {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        let http = build_http_client(settings.connect_timeout, settings.request_timeout)
            .context("failed to build source HTTP client")?;
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            settings.requests_per_minute,
            settings.burst_capacity,
        ));
        let breaker = Arc::new(CircuitBreaker::new(SERVICE, settings.breaker.clone()));
        Ok(Self {
            http,
            settings,
            limiter,
            breaker,
        })
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Lazily page through records matching `query`.
    ///
    /// Each page requests at most `min(batch_size, 10)` records, fewer when
    /// the overall limit is close. Records that fail to parse are skipped.
    /// The stream ends when the server returns no cursor or an empty page,
    /// or when `query.limit` records have been yielded.
    pub fn fetch(&self, query: FetchQuery) -> impl Stream<Item = Result<Record, ApiError>> + '_ {
        try_stream! {
            let batch_size = self.settings.batch_size.clamp(1, MAX_PAGE_SIZE) as usize;
            let mut cursor: Option<String> = None;
            let mut fetched = 0usize;

            tracing::debug!(
                start = ?query.start,
                end = ?query.end,
                limit = ?query.limit,
                starred_only = query.starred_only,
                "fetching records"
            );

            'pages: loop {
                let page_size = match query.limit {
                    Some(limit) if fetched >= limit => break 'pages,
                    Some(limit) => batch_size.min(limit - fetched),
                    None => batch_size,
                };

                let page = self.fetch_page(&query, cursor.as_deref(), page_size).await?;
                if page.records.is_empty() {
                    break 'pages;
                }

                for raw in page.records {
                    match Record::from_value(raw) {
                        Ok(record) => {
                            fetched += 1;
                            yield record;
                            if query.limit.is_some_and(|limit| fetched >= limit) {
                                break 'pages;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed record");
                        }
                    }
                }

                match page.next_cursor {
                    Some(next) if !next.is_empty() => cursor = Some(next),
                    _ => break 'pages,
                }
            }

            tracing::debug!(fetched, "fetch complete");
        }
    }

    /// Fetch a single record. A 404 yields `Ok(None)`.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Record>, ApiError> {
        let url = format!("{}/v1/lifelogs/{id}", self.base_url());
        let params = [
            ("timezone", self.settings.timezone.clone()),
            ("includeMarkdown", "true".to_string()),
            ("includeHeadings", "true".to_string()),
            ("includeContents", "true".to_string()),
        ];

        let raw = retry("source.get_by_id", &self.settings.retry, || {
            self.guarded(|| async {
                let response = self
                    .http
                    .get(&url)
                    .header("X-API-Key", &self.settings.api_key)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|e| transport_error(SERVICE, e))?;

                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = check_status(SERVICE, response).await?;
                let envelope: SingleEnvelope = read_json(SERVICE, response).await?;
                Ok(envelope.data.and_then(|d| d.lifelog))
            })
        })
        .await?;

        match raw {
            None => {
                tracing::debug!(record_id = id, "record not found");
                Ok(None)
            }
            Some(value) => Record::from_value(value)
                .map(Some)
                .map_err(|e| ApiError::InvalidResponse {
                    service: SERVICE,
                    message: format!("record {id}: {e}"),
                }),
        }
    }

    /// Request a single record to check credentials and reachability.
    pub async fn test_connection(&self) -> Result<(), ApiError> {
        self.fetch_page(&FetchQuery::default(), None, 1).await?;
        tracing::info!("source API connection ok");
        Ok(())
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            rate_limiter: self.limiter.stats(),
            circuit: self.breaker.stats(),
        }
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    async fn fetch_page(
        &self,
        query: &FetchQuery,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, ApiError> {
        let url = format!("{}/v1/lifelogs", self.base_url());
        let params = self.page_params(query, cursor, limit);

        let envelope: ListEnvelope = retry("source.fetch_page", &self.settings.retry, || {
            self.guarded(|| async {
                let response = self
                    .http
                    .get(&url)
                    .header("X-API-Key", &self.settings.api_key)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|e| transport_error(SERVICE, e))?;
                let response = check_status(SERVICE, response).await?;
                read_json(SERVICE, response).await
            })
        })
        .await?;

        Ok(Page {
            records: envelope.data.and_then(|d| d.lifelogs).unwrap_or_default(),
            next_cursor: envelope
                .meta
                .and_then(|m| m.lifelogs)
                .and_then(|c| c.next_cursor),
        })
    }

    fn page_params(
        &self,
        query: &FetchQuery,
        cursor: Option<&str>,
        limit: usize,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("timezone", self.settings.timezone.clone()),
            ("limit", limit.to_string()),
            ("direction", query.direction.as_str().to_string()),
            ("includeMarkdown", "true".to_string()),
            ("includeHeadings", "true".to_string()),
            ("includeContents", "true".to_string()),
        ];
        if let Some(start) = query.start {
            params.push(("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(end) = query.end {
            params.push(("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        if query.starred_only {
            params.push(("isStarred", "true".to_string()));
        }
        params
    }

    /// Run one request through the limiter and breaker, feeding the outcome
    /// back into the limiter. A 429 slows the limiter (and sleeps through any
    /// retry-after) before the error is returned.
    async fn guarded<F, Fut, T>(&self, request: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.limiter.acquire(1).await;

        let result = self
            .breaker
            .call(request)
            .await
            .map_err(|e| ApiError::from_circuit(SERVICE, e));

        match &result {
            Ok(_) => self.limiter.record_success(),
            Err(ApiError::RateLimited { retry_after, .. }) => {
                self.limiter.record_rate_limit(*retry_after).await;
            }
            Err(_) => self.limiter.record_error(),
        }
        result
    }
}
