//! CLI `run`, `sync` and `retry` commands.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use lifesync::config::LifesyncConfig;
use lifesync::health::{self, HealthChecker, HealthMonitor};
use lifesync::notify::{build_notifier, Alert, Notifier, Severity};
use lifesync::sync::{run_scheduler, SchedulerSettings, SyncResult};

use super::{build_components, Components};

/// Long-running agent: scheduled passes, retry sweeps and the health server,
/// until SIGINT or SIGTERM.
pub async fn run(config: LifesyncConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);
    let notifier = build_notifier(&config.notifications)?;

    let components = match startup(&config, Arc::clone(&notifier)).await {
        Ok(components) => components,
        Err(e) => {
            notifier
                .alert(&Alert::new(
                    Severity::Critical,
                    "Startup failed",
                    format!("{e:#}"),
                ))
                .await;
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, finishing current record");
        let _ = shutdown_tx.send(true);
    });

    let checker = HealthChecker::new(components.store.clone(), Arc::clone(&config));
    let server = config.server.health_enabled.then(|| {
        let checker = checker.clone();
        let host = config.server.health_host.clone();
        let port = config.server.health_port;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(checker, &host, port, shutdown).await {
                tracing::error!(error = %e, "health server failed");
            }
        })
    });

    notifier
        .alert(&Alert::new(
            Severity::Info,
            "Sync agent started",
            format!(
                "Syncing every {} minutes into bucket {}.",
                config.sync.interval_minutes, config.destination.bucket
            ),
        ))
        .await;

    let monitor = HealthMonitor::new(checker, Arc::clone(&notifier));
    let settings = SchedulerSettings {
        interval: config.sync.interval(),
        retry_after_pass: true,
    };
    let orchestrator = run_scheduler(
        components.orchestrator,
        settings,
        Some(monitor),
        shutdown_rx,
    )
    .await;

    if let Some(server) = server {
        let _ = server.await;
    }

    let stats = orchestrator.store().sync_stats().await.ok();
    notifier
        .alert(&Alert::new(
            Severity::Info,
            "Sync agent stopped",
            match stats {
                Some(s) => format!("{} records in ledger, last sync {:?}.", s.total_synced, s.last_sync_time),
                None => "Shut down cleanly.".to_string(),
            },
        ))
        .await;
    tracing::info!("sync agent stopped");
    Ok(())
}

/// One pass followed by a retry sweep.
pub async fn sync_once(config: LifesyncConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let notifier = build_notifier(&config.notifications)?;
    let mut components = build_components(&config, notifier)?;
    let shutdown = signal_channel();

    let pass = components.orchestrator.run_pass(&shutdown).await?;
    print_result("Sync pass", &pass);

    let retried = components.orchestrator.retry_failed(&shutdown).await?;
    if retried.total_processed > 0 {
        print_result("Retry sweep", &retried);
    }
    Ok(())
}

/// Only the bounded retry sweep.
pub async fn retry(config: LifesyncConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let notifier = build_notifier(&config.notifications)?;
    let mut components = build_components(&config, notifier)?;
    let shutdown = signal_channel();

    let retried = components.orchestrator.retry_failed(&shutdown).await?;
    if retried.total_processed == 0 {
        println!("No records eligible for retry.");
    } else {
        print_result("Retry sweep", &retried);
    }
    Ok(())
}

/// Open the store, prune old history, verify both APIs and the bucket.
async fn startup(config: &LifesyncConfig, notifier: Arc<dyn Notifier>) -> Result<Components> {
    let components = build_components(config, notifier)?;

    components
        .store
        .cleanup_old_data(config.storage.retention_days)
        .await
        .context("retention cleanup failed")?;

    components
        .source
        .test_connection()
        .await
        .context("source API connection test failed")?;
    components
        .destination
        .test_connection()
        .await
        .context("destination API connection test failed")?;
    components
        .destination
        .ensure_storage_target(&config.destination.bucket)
        .await
        .with_context(|| format!("could not ensure bucket {}", config.destination.bucket))?;

    Ok(components)
}

/// A shutdown channel flipped by SIGINT/SIGTERM.
fn signal_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_result(label: &str, result: &SyncResult) {
    println!("{label} {}", result.sync_id);
    println!("  Processed:   {}", result.total_processed);
    println!("  Succeeded:   {}", result.success_count);
    println!("  Failed:      {}", result.error_count);
    println!("  Duration:    {:.1}s", result.duration_seconds);
    if result.interrupted {
        println!("  Interrupted by shutdown");
    }
    for err in &result.errors {
        println!("  - {err}");
    }
}
