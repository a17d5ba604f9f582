use crate::artifact::{ArtifactData, ArtifactStore};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::job::Job;
use crate::launcher::{LaunchSpec, Launcher};
use crate::registry::{CommandKind, CommandSpec, ParamKind, StaticRegistry};
use crate::types::{ArtifactId, ParamValue, Parameters};
use anyhow::bail;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Launcher that records every launch without running anything.
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<LaunchSpec>>,
}

impl RecordingLauncher {
    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        self.launched.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

/// Launcher whose every launch fails, to exercise the launch-error path.
pub struct FailingLauncher;

#[async_trait]
impl Launcher for FailingLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> anyhow::Result<()> {
        bail!("launcher unavailable")
    }
}

#[derive(Clone)]
pub struct CreatedArtifact {
    pub id: ArtifactId,
    pub data: ArtifactData,
    pub parents: Vec<ArtifactId>,
    pub provenance: Option<serde_json::Value>,
}

/// Artifact store that fabricates ids and records every creation.
#[derive(Default)]
pub struct RecordingArtifactStore {
    created: Mutex<Vec<CreatedArtifact>>,
}

impl RecordingArtifactStore {
    pub fn created(&self) -> Vec<CreatedArtifact> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for RecordingArtifactStore {
    async fn create_artifact(
        &self,
        data: &ArtifactData,
        parents: &[ArtifactId],
        processing_parameters: Option<&serde_json::Value>,
    ) -> anyhow::Result<ArtifactId> {
        let id = ArtifactId::new();
        self.created.lock().unwrap().push(CreatedArtifact {
            id,
            data: data.clone(),
            parents: parents.to_vec(),
            provenance: processing_parameters.cloned(),
        });
        Ok(id)
    }
}

pub fn test_registry() -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    registry.register(CommandSpec::new(
        "split-libraries",
        CommandKind::Processing,
        [
            ("input".to_string(), ParamKind::Artifact),
            ("barcode-type".to_string(), ParamKind::Scalar),
        ]
        .into(),
        vec!["demultiplexed".to_string()],
    ));
    registry.register(CommandSpec::new(
        "pick-otus",
        CommandKind::Processing,
        [
            ("input".to_string(), ParamKind::Artifact),
            ("similarity".to_string(), ParamKind::Scalar),
        ]
        .into(),
        vec!["otu-table".to_string()],
    ));
    registry.register(CommandSpec::new(
        "merge-tables",
        CommandKind::Processing,
        [
            ("left".to_string(), ParamKind::Artifact),
            ("right".to_string(), ParamKind::Artifact),
        ]
        .into(),
        vec!["merged".to_string()],
    ));
    registry.register(CommandSpec::new(
        "import-sequences",
        CommandKind::ArtifactDefinition,
        [("template".to_string(), ParamKind::Scalar)].into(),
        vec!["imported".to_string()],
    ));
    registry
}

/// Engine wired to recording collaborators on a temporary store.
pub struct Harness {
    pub engine: Engine,
    pub launcher: Arc<RecordingLauncher>,
    pub artifacts: Arc<RecordingArtifactStore>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let recording = Arc::new(RecordingLauncher::default());
        Self::build(recording.clone(), recording)
    }

    pub fn failing_launcher() -> Self {
        Self::build(
            Arc::new(FailingLauncher),
            Arc::new(RecordingLauncher::default()),
        )
    }

    fn build(launcher: Arc<dyn Launcher>, recording: Arc<RecordingLauncher>) -> Self {
        let dir = TempDir::new().unwrap();
        let artifacts = Arc::new(RecordingArtifactStore::default());
        let engine = Engine::with_launcher(
            EngineConfig::with_data_dir(dir.path().to_path_buf()),
            Arc::new(test_registry()),
            artifacts.clone(),
            launcher,
        )
        .unwrap();
        Self {
            engine,
            launcher: recording,
            artifacts,
            _dir: dir,
        }
    }

    pub fn artifact_definition_job(&self) -> Job {
        Job::create(
            &self.engine,
            "demo@example.com",
            params(
                "import-sequences",
                [("template".to_string(), scalar("mapping.txt"))],
            ),
        )
        .unwrap()
    }

    pub async fn running_artifact_definition_job(&self) -> Job {
        let job = self.artifact_definition_job();
        job.submit().await.unwrap();
        job.update_heartbeat_state().unwrap();
        job
    }
}

pub fn scalar(value: impl Into<serde_json::Value>) -> ParamValue {
    ParamValue::Scalar {
        value: value.into(),
    }
}

pub fn artifact(id: ArtifactId) -> ParamValue {
    ParamValue::Artifact { id }
}

pub fn params(
    command: &str,
    values: impl IntoIterator<Item = (String, ParamValue)>,
) -> Parameters {
    Parameters::new(command, values.into_iter().collect::<BTreeMap<_, _>>())
}

/// One output slot filled with a placeholder file.
pub fn data(output: &str) -> BTreeMap<String, ArtifactData> {
    [(
        output.to_string(),
        ArtifactData::new(
            vec![(PathBuf::from("out.biom"), "biom".to_string())],
            "BIOM",
        ),
    )]
    .into()
}

/// Give detached launch tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
