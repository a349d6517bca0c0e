//! Fixed-interval driver for sync passes.
//!
//! The first pass runs immediately. Ticks that come due while a pass is still
//! running are skipped rather than queued, so a slow pass delays the next one
//! instead of stacking several behind it.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::SyncOrchestrator;
use crate::health::HealthMonitor;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Run the bounded retry sweep after every pass.
    pub retry_after_pass: bool,
}

/// Drive passes until `shutdown` flips to `true` (or its sender is dropped).
///
/// Returns the orchestrator so the caller can finish up with it.
pub async fn run_scheduler(
    mut orchestrator: SyncOrchestrator,
    settings: SchedulerSettings,
    health: Option<HealthMonitor>,
    mut shutdown: watch::Receiver<bool>,
) -> SyncOrchestrator {
    let mut ticker = time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(interval_secs = settings.interval.as_secs(), "scheduler started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match orchestrator.run_pass(&shutdown).await {
            Ok(result) if result.interrupted => break,
            Ok(_) => {}
            Err(e) => {
                // already logged, recorded and alerted by the orchestrator
                tracing::debug!(error = %e, "scheduled pass failed");
            }
        }

        if settings.retry_after_pass && !*shutdown.borrow() {
            if let Err(e) = orchestrator.retry_failed(&shutdown).await {
                tracing::error!(error = %e, "retry sweep failed");
            }
        }

        if let Some(monitor) = &health {
            monitor.check_and_alert().await;
        }
    }

    tracing::info!("scheduler stopped");
    orchestrator
}
