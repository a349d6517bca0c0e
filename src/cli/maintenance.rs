//! CLI `cleanup` command: retention cleanup of error and metrics history.

use anyhow::Result;

use lifesync::config::LifesyncConfig;

/// Delete error and metrics rows older than `days` (default: configured retention).
pub async fn cleanup(config: &LifesyncConfig, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.storage.retention_days);
    let store = super::open_store(config)?;

    println!("Removing history older than {days} days...");
    let report = store.cleanup_old_data(days).await?;
    println!("  Errors deleted:   {}", report.errors_deleted);
    println!("  Metrics deleted:  {}", report.metrics_deleted);
    println!("  Sync ledger untouched.");
    Ok(())
}
