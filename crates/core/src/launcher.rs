use crate::config::EngineConfig;
use crate::types::JobId;
use anyhow::bail;
use async_trait::async_trait;
use std::path::PathBuf;

/// Everything a launcher needs to start one job on the compute backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub job_id: JobId,
    pub command: String,
    pub work_dir: PathBuf,
    pub callback_url: String,
}

impl LaunchSpec {
    pub fn new(config: &EngineConfig, job_id: JobId, command: impl Into<String>) -> Self {
        Self {
            job_id,
            command: command.into(),
            work_dir: config.work_dir().join(job_id.to_string()),
            callback_url: format!("{}/jobs/{}", config.base_url, job_id),
        }
    }
}

/// Hands a queued job to the compute backend. A launch error means the job
/// never started; the engine converts it into a job failure rather than
/// surfacing it to the submitter.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<()>;
}

/// Launches jobs by spawning an external program, passing the job id and
/// callback URL on the command line. The program is expected to drive the
/// job's heartbeat and completion through the callback.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&spec.work_dir).await?;

        let output = tokio::process::Command::new(&self.program)
            .arg(&spec.command)
            .arg(spec.job_id.to_string())
            .arg(&spec.callback_url)
            .current_dir(&spec.work_dir)
            .output()
            .await?;

        if !output.status.success() {
            bail!(
                "launcher exited with {}: stdout: {} stderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }
}
