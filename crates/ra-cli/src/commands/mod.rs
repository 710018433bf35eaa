pub mod inspect;
pub mod lifecycle;
pub mod script;

use std::sync::Arc;

use anyhow::Context;
use ra_agents::autonomous::{AutonomousLoop, LoopSettings};
use ra_agents::orchestrator::LifecycleOrchestrator;
use ra_core::config::Config;
use ra_core::sqlite_store::SqliteAgentStore;
use ra_core::store::AgentStore;
use ra_harness::functions::FunctionRegistry;
use ra_harness::provider::ScriptedEngine;

/// Open the configured SQLite store, creating its directory if needed.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn AgentStore>> {
    let path = config.store.resolved_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }
    let store = SqliteAgentStore::new(&path)
        .await
        .with_context(|| format!("could not open agent store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Orchestrator over `store`. With an engine, the default subtype runs an
/// autonomous loop driven by it; without one only inspection and
/// non-launching operations work.
pub fn orchestrator(
    config: &Config,
    store: Arc<dyn AgentStore>,
    engine: Option<ScriptedEngine>,
) -> LifecycleOrchestrator {
    let mut orchestrator = LifecycleOrchestrator::new(store.clone()).with_config(&config.agents);
    if let Some(engine) = engine {
        let executor = AutonomousLoop::new(store, Arc::new(engine), Arc::new(FunctionRegistry::new()))
            .with_settings(LoopSettings::from_config(&config.agents))
            .with_metrics(orchestrator.metrics().clone());
        orchestrator = orchestrator.with_executor(Arc::new(executor));
    }
    orchestrator
}
