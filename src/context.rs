use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::executor::{CommandExecutor, TaskExecutor};
use crate::governor::ResourceGovernor;
use crate::locks::LockManager;
use crate::pipeline::PipelineRegistry;
use std::sync::Arc;

/// Shared handles threaded through every orchestration call.
///
/// Budgets, locks and the artifact store are file-backed; this struct only
/// holds the handles and the resolved configuration, never authoritative
/// state.
pub struct OrchestrationContext {
    pub config: Config,
    pub store: ArtifactStore,
    pub locks: LockManager,
    pub governor: ResourceGovernor,
    pub pipelines: PipelineRegistry,
    pub executor: Arc<dyn TaskExecutor>,
}

impl OrchestrationContext {
    pub fn new(config: Config, executor: Arc<dyn TaskExecutor>) -> Result<Self, OrchestratorError> {
        let pipelines = PipelineRegistry::with_configured(&config.toml().pipelines)?;
        Ok(Self {
            store: ArtifactStore::new(&config.runs_dir),
            locks: LockManager::new(&config.project_dir, &config.state_dir)
                .with_wait(config.lock_wait)
                .with_os_permissions(config.os_permissions),
            governor: ResourceGovernor::new(&config.state_dir, config.budgets.clone()),
            pipelines,
            executor,
            config,
        })
    }

    /// Context whose executor is the configured agent command.
    pub fn from_config(config: Config) -> Result<Self, OrchestratorError> {
        let executor = Arc::new(CommandExecutor::from_settings(&config.executor));
        Self::new(config, executor)
    }
}
