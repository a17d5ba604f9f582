use crate::artifact::ArtifactStore;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::launcher::{Launcher, ProcessLauncher};
use crate::registry::{CommandRegistry, CommandSpec};
use crate::storage::Store;
use crate::types::{JobId, WorkflowId};
use crate::workflow::Workflow;
use std::sync::Arc;

/// Entry point to the orchestration engine. Cheap to clone; all state lives
/// in the store, the handles returned here carry only an id.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<Store>,
    pub(crate) registry: Arc<dyn CommandRegistry>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) config: Arc<EngineConfig>,
}

impl Engine {
    /// Open the engine with the default process launcher.
    pub fn open(
        config: EngineConfig,
        registry: Arc<dyn CommandRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.launcher_program()));
        Self::with_launcher(config, registry, artifacts, launcher)
    }

    pub fn with_launcher(
        config: EngineConfig,
        registry: Arc<dyn CommandRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let store = Arc::new(Store::open(config.store_path())?);
        Ok(Self {
            store,
            registry,
            artifacts,
            launcher,
            config: Arc::new(config),
        })
    }

    /// Handle for an existing job. Does not verify existence; operations on
    /// the handle surface `JobNotFound` when the id is stale.
    pub fn job(&self, id: JobId) -> Job {
        Job::from_id(self.clone(), id)
    }

    pub fn job_exists(&self, id: &JobId) -> Result<bool> {
        self.store.job_exists(id)
    }

    /// Handle for an existing workflow.
    pub fn workflow(&self, id: WorkflowId) -> Workflow {
        Workflow::from_id(self.clone(), id)
    }

    pub(crate) fn require_command(&self, name: &str) -> Result<CommandSpec> {
        self.registry
            .command(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }
}
