use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LifesyncConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub sync: SyncConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub health_enabled: bool,
    pub health_host: String,
    pub health_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Error and metrics rows older than this are removed by cleanup.
    pub retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub api_url: String,
    pub api_key: String,
    pub timezone: String,
    pub batch_size: u32,
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub max_attempts: u32,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DestinationConfig {
    pub api_url: String,
    pub api_key: String,
    pub bucket: String,
    pub max_poll_attempts: u32,
    pub poll_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_minutes: u64,
    /// Subtracted from the watermark when computing the fetch window.
    pub watermark_buffer_minutes: i64,
    /// Fetch window for a store that has never completed a pass.
    pub initial_lookback_hours: i64,
    pub max_retries: u32,
    pub stale_after_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    /// `log` or `mailgun`.
    pub provider: String,
    pub mailgun_api_key: String,
    pub mailgun_domain: String,
    pub alert_email: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            health_enabled: true,
            health_host: "0.0.0.0".into(),
            health_port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_lifesync_dir()
            .join("lifesync.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            retention_days: 90,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.limitless.ai".into(),
            api_key: String::new(),
            timezone: "America/Los_Angeles".into(),
            batch_size: 10,
            requests_per_minute: 180,
            burst_capacity: 30,
            max_attempts: 3,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 60,
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://memorybox.amotivv.ai".into(),
            api_key: String::new(),
            bucket: "Limitless-Lifelogs".into(),
            max_poll_attempts: 10,
            poll_interval_secs: 2,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 60,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            watermark_buffer_minutes: 5,
            initial_lookback_hours: 24,
            max_retries: 3,
            stale_after_minutes: 120,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            provider: "log".into(),
            mailgun_api_key: String::new(),
            mailgun_domain: String::new(),
            alert_email: String::new(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// Returns `~/.lifesync/`
pub fn default_lifesync_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".lifesync")
}

/// Returns the default config file path: `~/.lifesync/config.toml`
pub fn default_config_path() -> PathBuf {
    default_lifesync_dir().join("config.toml")
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LifesyncConfig {
    /// Load config from the default TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            LifesyncConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 8] = [
            ("LIFESYNC_SOURCE_API_KEY", &mut self.source.api_key),
            ("LIFESYNC_DESTINATION_API_KEY", &mut self.destination.api_key),
            ("LIFESYNC_BUCKET", &mut self.destination.bucket),
            ("LIFESYNC_DB", &mut self.storage.db_path),
            ("LIFESYNC_LOG_LEVEL", &mut self.server.log_level),
            ("LIFESYNC_MAILGUN_API_KEY", &mut self.notifications.mailgun_api_key),
            ("LIFESYNC_MAILGUN_DOMAIN", &mut self.notifications.mailgun_domain),
            ("LIFESYNC_ALERT_EMAIL", &mut self.notifications.alert_email),
        ];
        for (var, slot) in overrides {
            if let Ok(val) = std::env::var(var) {
                *slot = val;
            }
        }
    }

    /// Check every setting against its allowed range.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.source.api_key.trim().is_empty(),
            "source.api_key is required (or set LIFESYNC_SOURCE_API_KEY)"
        );
        ensure!(
            !self.destination.api_key.trim().is_empty(),
            "destination.api_key is required (or set LIFESYNC_DESTINATION_API_KEY)"
        );
        ensure!(
            !self.destination.bucket.trim().is_empty(),
            "destination.bucket must not be empty"
        );
        ensure!(
            (5..=1440).contains(&self.sync.interval_minutes),
            "sync.interval_minutes must be between 5 and 1440, got {}",
            self.sync.interval_minutes
        );
        ensure!(
            (1..=100).contains(&self.source.batch_size),
            "source.batch_size must be between 1 and 100, got {}",
            self.source.batch_size
        );
        ensure!(
            (1..=300).contains(&self.source.requests_per_minute),
            "source.requests_per_minute must be between 1 and 300, got {}",
            self.source.requests_per_minute
        );
        ensure!(self.source.burst_capacity >= 1, "source.burst_capacity must be at least 1");
        ensure!(self.source.max_attempts >= 1, "source.max_attempts must be at least 1");
        ensure!(
            (1..=50).contains(&self.destination.max_poll_attempts),
            "destination.max_poll_attempts must be between 1 and 50, got {}",
            self.destination.max_poll_attempts
        );
        ensure!(
            (1..=30).contains(&self.destination.poll_interval_secs),
            "destination.poll_interval_secs must be between 1 and 30, got {}",
            self.destination.poll_interval_secs
        );
        ensure!(
            self.server.health_port >= 1024,
            "server.health_port must be at least 1024, got {}",
            self.server.health_port
        );
        ensure!(
            LOG_LEVELS.contains(&self.server.log_level.to_lowercase().as_str()),
            "server.log_level must be one of {}, got {}",
            LOG_LEVELS.join(", "),
            self.server.log_level
        );
        ensure!(self.sync.watermark_buffer_minutes >= 0, "sync.watermark_buffer_minutes must not be negative");

        match self.notifications.provider.as_str() {
            "log" => {}
            "mailgun" => {
                ensure!(
                    !self.notifications.mailgun_api_key.is_empty()
                        && !self.notifications.mailgun_domain.is_empty()
                        && !self.notifications.alert_email.is_empty(),
                    "mailgun notifications need mailgun_api_key, mailgun_domain and alert_email"
                );
            }
            other => anyhow::bail!("unknown notification provider: {other}. Supported: log, mailgun"),
        }

        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
