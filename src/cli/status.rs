use anyhow::Result;

use lifesync::config::LifesyncConfig;
use lifesync::state::ProcessingStatus;

/// Print ledger statistics, recent passes and recent errors.
pub async fn status(config: &LifesyncConfig) -> Result<()> {
    let store = super::open_store(config)?;
    let stats = store.sync_stats().await?;
    let watermark = store.watermark().await?;
    let passes = store.recent_metrics(7).await?;
    let errors = store.recent_errors(24).await?;

    println!("Sync Status");
    println!("{}", "=".repeat(40));
    println!("  Ledger records:      {}", stats.total_synced);
    println!("  Delivered (total):   {}", stats.total_delivered);
    match watermark.last_sync_time {
        Some(t) => println!("  Watermark:           {t}"),
        None => println!("  Watermark:           (none yet)"),
    }
    println!("  Synced in 24h:       {}", stats.recent_syncs_24h);
    println!("  Errors in 24h:       {}", stats.recent_errors_24h);
    println!();

    println!("By Status:");
    for status in ProcessingStatus::ALL {
        let count = stats.status_breakdown.get(status.as_str()).copied().unwrap_or(0);
        println!("  {:<12} {}", status.as_str(), count);
    }
    println!();

    println!("Recent Passes (7 days):");
    if passes.is_empty() {
        println!("  (none)");
    }
    for pass in passes.iter().take(10) {
        let duration = pass
            .total_duration_seconds
            .map(|d| format!("{d:.1}s"))
            .unwrap_or_else(|| "running".to_string());
        println!(
            "  {}  processed={} ok={} failed={} ({duration})",
            pass.sync_started_at.format("%Y-%m-%d %H:%M"),
            pass.records_processed,
            pass.records_successful,
            pass.records_failed,
        );
    }

    if !errors.is_empty() {
        println!();
        println!("Recent Errors (24h):");
        for err in errors.iter().take(10) {
            let resolved = if err.resolved_at.is_some() { " [resolved]" } else { "" };
            println!(
                "  {}  {} {}: {}{resolved}",
                err.occurred_at.format("%H:%M:%S"),
                err.error_type,
                err.record_id.as_deref().unwrap_or("-"),
                err.error_message,
            );
        }
    }

    Ok(())
}
