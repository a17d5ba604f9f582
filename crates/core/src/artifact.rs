use crate::types::ArtifactId;
use async_trait::async_trait;
use std::path::PathBuf;

/// Raw material for a new artifact, reported by a job on success: the files
/// it produced (path plus filepath type) and the artifact type to register.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactData {
    pub filepaths: Vec<(PathBuf, String)>,
    pub artifact_type: String,
}

impl ArtifactData {
    pub fn new(filepaths: Vec<(PathBuf, String)>, artifact_type: impl Into<String>) -> Self {
        Self {
            filepaths,
            artifact_type: artifact_type.into(),
        }
    }
}

/// Materializes job outputs into the artifact catalog. Processing outputs
/// carry their input artifacts as parents and the job's parameters as
/// provenance; artifact-definition outputs carry neither.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create_artifact(
        &self,
        data: &ArtifactData,
        parents: &[ArtifactId],
        processing_parameters: Option<&serde_json::Value>,
    ) -> anyhow::Result<ArtifactId>;
}
