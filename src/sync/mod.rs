//! Sync passes: orchestration of one pass and the fixed-interval scheduler.

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{OrchestratorSettings, SyncOrchestrator};
pub use scheduler::{run_scheduler, SchedulerSettings};

use serde::Serialize;

use crate::client::ApiError;
use crate::state::StateError;

/// Outcome of a sync pass or retry sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub sync_id: String,
    pub success_count: u64,
    pub error_count: u64,
    pub total_processed: u64,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
    /// Shutdown stopped the pass before every candidate was attempted.
    pub interrupted: bool,
}

impl SyncResult {
    pub(crate) fn new(sync_id: String) -> Self {
        Self {
            sync_id,
            success_count: 0,
            error_count: 0,
            total_processed: 0,
            duration_seconds: 0.0,
            errors: Vec::new(),
            interrupted: false,
        }
    }

    /// Fraction of processed records that succeeded; 1.0 when nothing was processed.
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            1.0
        } else {
            self.success_count as f64 / self.total_processed as f64
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0 || !self.errors.is_empty()
    }

    pub(crate) fn record_success(&mut self) {
        self.total_processed += 1;
        self.success_count += 1;
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.total_processed += 1;
        self.error_count += 1;
        self.errors.push(error);
    }
}

/// A failure that ended a pass early.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Api(#[from] ApiError),
}

impl PassError {
    /// Credentials were rejected; further passes will fail the same way.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_authentication())
    }
}
