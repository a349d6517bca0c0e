//! Operator notifications.
//!
//! The sync core reports each finished pass and raises alerts for pass-level
//! failures, health transitions, startup and shutdown. Notifiers never return
//! errors: a failed delivery is logged and dropped.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NotificationConfig;
use crate::sync::SyncResult;

const MAILGUN_API: &str = "https://api.mailgun.net/v3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// A one-off operator alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called once after every completed pass.
    async fn report_pass(&self, result: &SyncResult);

    async fn alert(&self, alert: &Alert);
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn report_pass(&self, result: &SyncResult) {
        tracing::info!(
            sync_id = %result.sync_id,
            processed = result.total_processed,
            succeeded = result.success_count,
            failed = result.error_count,
            duration_secs = result.duration_seconds,
            "sync pass summary"
        );
    }

    async fn alert(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => tracing::info!(title = %alert.title, "{}", alert.message),
            Severity::Warning => tracing::warn!(title = %alert.title, "{}", alert.message),
            Severity::Critical => tracing::error!(title = %alert.title, "{}", alert.message),
        }
    }
}

/// Sends plain-text mail through the Mailgun HTTP API.
pub struct MailgunNotifier {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
    to: String,
}

impl MailgunNotifier {
    pub fn new(api_key: &str, domain: &str, to: &str) -> anyhow::Result<Self> {
        Self::with_base_url(MAILGUN_API, api_key, domain, to)
    }

    /// Point at a different API root (used against local fakes).
    pub fn with_base_url(
        base_url: &str,
        api_key: &str,
        domain: &str,
        to: &str,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/{domain}/messages", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            from: format!("Lifesync <sync@{domain}>"),
            to: to.to_string(),
        })
    }

    async fn send(&self, subject: &str, text: &str, high_priority: bool) {
        let mut form = vec![
            ("from", self.from.as_str()),
            ("to", self.to.as_str()),
            ("subject", subject),
            ("text", text),
        ];
        if high_priority {
            form.push(("h:X-Priority", "1"));
            form.push(("h:Importance", "high"));
        }

        let result = self
            .http
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(subject, "notification email sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::error!(%status, body = %body, "notification email rejected");
            }
            Err(e) => tracing::error!(error = %e, "notification email failed"),
        }
    }
}

#[async_trait]
impl Notifier for MailgunNotifier {
    /// Mails a summary only when the pass had failures.
    async fn report_pass(&self, result: &SyncResult) {
        if !result.has_errors() {
            return;
        }
        let subject = format!("Lifesync summary - {} errors", result.error_count);
        let mut body = format!(
            "Sync {}\n\nProcessed: {}\nSucceeded: {}\nFailed: {}\nSuccess rate: {:.1}%\nDuration: {:.2}s\n",
            result.sync_id,
            result.total_processed,
            result.success_count,
            result.error_count,
            result.success_rate() * 100.0,
            result.duration_seconds,
        );
        if !result.errors.is_empty() {
            body.push_str("\nErrors:\n");
            for err in result.errors.iter().take(10) {
                body.push_str(&format!("- {err}\n"));
            }
        }
        self.send(&subject, &body, false).await;
    }

    async fn alert(&self, alert: &Alert) {
        let subject = format!("Lifesync {}: {}", alert.severity, alert.title);
        self.send(&subject, &alert.message, alert.severity == Severity::Critical)
            .await;
    }
}

/// Build the notifier named by `notifications.provider`.
pub fn build_notifier(config: &NotificationConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match config.provider.as_str() {
        "mailgun" => Ok(Arc::new(MailgunNotifier::new(
            &config.mailgun_api_key,
            &config.mailgun_domain,
            &config.alert_email,
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}
