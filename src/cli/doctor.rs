//! CLI `doctor` command: configuration and database diagnostics.

use anyhow::{Context, Result};

use lifesync::config::LifesyncConfig;
use lifesync::db;

pub fn doctor(config: &LifesyncConfig) -> Result<()> {
    println!("Lifesync Health Report");
    println!("======================");
    println!();

    match config.validate() {
        Ok(()) => println!("Configuration:     OK"),
        Err(e) => println!("Configuration:     INVALID ({e:#})"),
    }
    println!("Source API:        {}", config.source.api_url);
    println!("Destination API:   {}", config.destination.api_url);
    println!("Bucket:            {}", config.destination.bucket);
    println!("Notifications:     {}", config.notifications.provider);
    println!();

    let db_path = config.resolved_db_path();
    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `lifesync sync` or `lifesync run` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!(
        "Schema version:    {} (expected {})",
        report.schema_version,
        db::migrations::CURRENT_SCHEMA_VERSION
    );
    println!();
    println!("Row counts:");
    println!("  Synced records:  {}", report.synced_count);
    println!("  Errors:          {}", report.error_count);
    println!("  Passes:          {}", report.metrics_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop the agent and restore from a backup: cp backup.db {}", db_path.display());
        println!("  2. Or move the file aside; the next run rebuilds an empty ledger");
        println!("     and re-delivers records inside the initial lookback window.");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
