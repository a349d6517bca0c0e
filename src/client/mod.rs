//! HTTP clients for the source (lifelog) and destination (memory store) APIs.
//!
//! Both clients share the [`ApiError`] taxonomy and the response
//! classification helpers in this module.

pub mod destination;
pub mod source;

pub use destination::{CreateOutcome, DestinationClient, DestinationSettings, DestinationStats};
pub use source::{Direction, FetchQuery, SourceClient, SourceSettings, SourceStats};

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::resilience::{BreakerFailure, CircuitError, RetryDecision, Retryable};

/// Maximum number of response-body characters kept in an error.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{service} API rejected the credentials (401)")]
    Authentication { service: &'static str },

    #[error("{service} API rate limit exceeded (429)")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("{service} API returned {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} API request failed: {source}")]
    Network {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} API request timed out")]
    Timeout { service: &'static str },

    #[error("{service} API circuit breaker is open")]
    CircuitOpen { service: &'static str },

    #[error("invalid response from {service} API: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl ApiError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { .. } => Some(401),
            Self::RateLimited { .. } => Some(429),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_circuit(service: &'static str, err: CircuitError<ApiError>) -> Self {
        match err {
            CircuitError::Rejected => Self::CircuitOpen { service },
            CircuitError::Inner(e) => e,
        }
    }
}

impl BreakerFailure for ApiError {
    fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Http { .. }
        )
    }
}

impl Retryable for ApiError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            // The limiter has already slept through the retry-after window.
            Self::RateLimited { .. } => RetryDecision::RetryNow,
            Self::Network { .. } | Self::Timeout { .. } => RetryDecision::Retry,
            Self::Http { status, .. } if *status >= 500 => RetryDecision::Retry,
            _ => RetryDecision::GiveUp,
        }
    }
}

/// Build a pooled HTTP client with connect and overall timeouts.
pub(crate) fn build_http_client(
    connect_timeout: Duration,
    request_timeout: Duration,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .user_agent(concat!("lifesync/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Map a transport-level failure.
pub(crate) fn transport_error(service: &'static str, err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout { service }
    } else {
        ApiError::Network {
            service,
            source: err,
        }
    }
}

/// Turn non-success statuses into errors. 404 is left to the caller.
pub(crate) async fn check_status(
    service: &'static str,
    response: Response,
) -> Result<Response, ApiError> {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::Authentication { service }),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited {
            service,
            retry_after: retry_after(&response),
        }),
        s if s.is_client_error() || s.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Http {
                service,
                status: s.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            })
        }
        _ => Ok(response),
    }
}

/// Read the body as text and deserialize it.
pub(crate) async fn read_json<T: DeserializeOwned>(
    service: &'static str,
    response: Response,
) -> Result<T, ApiError> {
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(service, e))?;
    serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse {
        service,
        message: e.to_string(),
    })
}

/// `Retry-After` in seconds (integer or fractional). HTTP-date values are ignored.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_http_errors_trip_breaker() {
        assert!(ApiError::Timeout { service: "source" }.trips_breaker());
        assert!(ApiError::Http {
            service: "source",
            status: 503,
            body: String::new()
        }
        .trips_breaker());
        assert!(!ApiError::Authentication { service: "source" }.trips_breaker());
        assert!(!ApiError::RateLimited {
            service: "source",
            retry_after: None
        }
        .trips_breaker());
        assert!(!ApiError::InvalidResponse {
            service: "source",
            message: "bad".into()
        }
        .trips_breaker());
    }

    #[test]
    fn retry_decisions_follow_error_kind() {
        let rate_limited = ApiError::RateLimited {
            service: "source",
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rate_limited.retry_decision(), RetryDecision::RetryNow);
        assert_eq!(
            ApiError::Timeout { service: "source" }.retry_decision(),
            RetryDecision::Retry
        );
        let bad_request = ApiError::Http {
            service: "source",
            status: 400,
            body: String::new(),
        };
        assert_eq!(bad_request.retry_decision(), RetryDecision::GiveUp);
        assert_eq!(
            ApiError::Authentication { service: "source" }.retry_decision(),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn circuit_rejection_maps_to_circuit_open() {
        let err = ApiError::from_circuit("destination", CircuitError::Rejected);
        assert!(matches!(err, ApiError::CircuitOpen { service: "destination" }));
    }
}
