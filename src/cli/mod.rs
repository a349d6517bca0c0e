pub mod doctor;
pub mod maintenance;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::sync::Arc;

use lifesync::client::{DestinationClient, DestinationSettings, SourceClient, SourceSettings};
use lifesync::config::LifesyncConfig;
use lifesync::notify::Notifier;
use lifesync::state::StateStore;
use lifesync::sync::{OrchestratorSettings, SyncOrchestrator};
use lifesync::transform::ContentProcessor;

/// Open the state database named by the config.
pub fn open_store(config: &LifesyncConfig) -> Result<StateStore> {
    let db_path = config.resolved_db_path();
    let conn = lifesync::db::open_database(&db_path)
        .with_context(|| format!("failed to open state database at {}", db_path.display()))?;
    Ok(StateStore::new(conn))
}

/// Everything a pass needs, wired from the config.
pub struct Components {
    pub store: StateStore,
    pub source: Arc<SourceClient>,
    pub destination: Arc<DestinationClient>,
    pub orchestrator: SyncOrchestrator,
}

pub fn build_components(config: &LifesyncConfig, notifier: Arc<dyn Notifier>) -> Result<Components> {
    let store = open_store(config)?;
    let source = Arc::new(SourceClient::new(SourceSettings::from_config(&config.source))?);
    let destination = Arc::new(DestinationClient::new(DestinationSettings::from_config(
        &config.destination,
    ))?);

    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        Arc::clone(&source),
        Arc::clone(&destination),
        Arc::new(ContentProcessor::new()),
        notifier,
        OrchestratorSettings::from_config(&config.sync),
    );

    Ok(Components {
        store,
        source,
        destination,
        orchestrator,
    })
}
