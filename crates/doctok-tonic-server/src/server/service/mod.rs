//! Service wiring: builds the orchestrator from [`ServerConfig`] and exposes
//! it through the gRPC [`handler`].

pub mod handler;

use crate::server::config::ServerConfig;
use anyhow::Context;
use doctok_tonic_core::doctok::{
    Collaborators, FsBlobSync, InProcessRegistry, LogBroadcaster, MemoryDatabase, Orchestrator,
    RuleBasedLoader, StaticConfigSource,
};
use std::sync::Arc;

/// Loads the seed data (if any) and builds the orchestrator on top of it.
pub async fn build_orchestrator(config: &ServerConfig) -> anyhow::Result<Orchestrator> {
    let database = match &config.seed_file {
        Some(path) => {
            let json = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            MemoryDatabase::from_json(&json)
                .with_context(|| format!("failed to load seed file {}", path.display()))?
        }
        None => MemoryDatabase::new(),
    };
    Ok(orchestrator_with(database, config))
}

/// Builds the orchestrator over an existing store.
pub fn orchestrator_with(database: MemoryDatabase, config: &ServerConfig) -> Orchestrator {
    let collaborators = Collaborators {
        database: Arc::new(database),
        tokenizer_loader: Arc::new(RuleBasedLoader::default()),
        config_source: Arc::new(StaticConfigSource::new(config.service.clone())),
        broadcaster: Arc::new(LogBroadcaster),
        blob_sync: Arc::new(FsBlobSync::new(config.export_dir.clone())),
        registry: Arc::new(InProcessRegistry::new()),
    };
    Orchestrator::new(collaborators, config.orchestrator_config())
}
