use crate::artifact::ArtifactData;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::launcher::LaunchSpec;
use crate::registry::{CommandKind, ParamKind};
use crate::types::{
    ArtifactId, JobId, JobRecord, JobStatus, LogRecord, ParamValue, Parameters, PendingMap,
};
use chrono::Utc;
use std::collections::BTreeMap;

/// Handle to one job. Holds no state besides the id; every accessor and
/// operation reads the freshest committed record from the store, so handles
/// held by concurrent tasks never observe stale status.
#[derive(Clone)]
pub struct Job {
    engine: Engine,
    id: JobId,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl Job {
    pub(crate) fn from_id(engine: Engine, id: JobId) -> Self {
        Self { engine, id }
    }

    /// Create a job in `in_construction` from a validated parameter set.
    ///
    /// Artifact-typed parameters either link an existing artifact as input or,
    /// when deferred, land in the pending map keyed by the producing job.
    pub fn create(engine: &Engine, owner: &str, parameters: Parameters) -> Result<Job> {
        let spec = engine.require_command(&parameters.command)?;

        for name in parameters.values.keys() {
            if !spec.parameters.contains_key(name) {
                return Err(Error::validation(format!(
                    "parameter '{name}' is not defined for command '{}'",
                    spec.name
                )));
            }
        }

        let id = JobId::new();
        let mut pending = PendingMap::new();
        let mut inputs = Vec::new();
        for (name, kind) in &spec.parameters {
            let value = parameters.values.get(name).ok_or_else(|| {
                Error::validation(format!(
                    "missing value for parameter '{name}' of command '{}'",
                    spec.name
                ))
            })?;
            match (kind, value) {
                (ParamKind::Artifact, ParamValue::Artifact { id }) => inputs.push(*id),
                (ParamKind::Artifact, ParamValue::Deferred { producer, output }) => {
                    if !engine.store.job_exists(producer)? {
                        return Err(Error::JobNotFound(*producer));
                    }
                    pending
                        .entry(*producer)
                        .or_default()
                        .insert(name.clone(), output.clone());
                }
                (ParamKind::Artifact, ParamValue::Scalar { .. }) => {
                    return Err(Error::validation(format!(
                        "parameter '{name}' of command '{}' must reference an artifact",
                        spec.name
                    )));
                }
                (ParamKind::Scalar, ParamValue::Scalar { .. }) => {}
                (ParamKind::Scalar, _) => {
                    return Err(Error::validation(format!(
                        "parameter '{name}' of command '{}' must be a plain value",
                        spec.name
                    )));
                }
            }
        }

        let record = JobRecord {
            id,
            owner: owner.to_string(),
            command: parameters.command.clone(),
            values: parameters.values,
            pending,
            status: JobStatus::InConstruction,
            heartbeat: None,
            step: None,
            log: None,
            created_at: Utc::now(),
        };
        engine.store.insert_job(&record)?;
        for artifact in inputs {
            engine.store.add_input(&id, &artifact)?;
        }

        tracing::info!(job_id = %id, command = %record.command, "created job");
        Ok(Job::from_id(engine.clone(), id))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    fn record(&self) -> Result<JobRecord> {
        self.engine.store.job(&self.id)
    }

    pub fn exists(&self) -> Result<bool> {
        self.engine.store.job_exists(&self.id)
    }

    pub fn status(&self) -> Result<JobStatus> {
        Ok(self.record()?.status)
    }

    pub fn owner(&self) -> Result<String> {
        Ok(self.record()?.owner)
    }

    pub fn command(&self) -> Result<String> {
        Ok(self.record()?.command)
    }

    pub fn parameters(&self) -> Result<Parameters> {
        let record = self.record()?;
        Ok(Parameters::new(record.command, record.values))
    }

    pub fn pending(&self) -> Result<PendingMap> {
        Ok(self.record()?.pending)
    }

    pub fn heartbeat(&self) -> Result<Option<chrono::DateTime<Utc>>> {
        Ok(self.record()?.heartbeat)
    }

    pub fn step(&self) -> Result<Option<String>> {
        Ok(self.record()?.step)
    }

    /// The error log entry of a failed job, if any.
    pub fn log(&self) -> Result<Option<LogRecord>> {
        match self.record()?.log {
            Some(log_id) => self.engine.store.get_log(&log_id),
            None => Ok(None),
        }
    }

    pub fn children(&self) -> Result<Vec<Job>> {
        Ok(self
            .engine
            .store
            .children_ids(&self.id)?
            .into_iter()
            .map(|id| Job::from_id(self.engine.clone(), id))
            .collect())
    }

    pub fn input_artifacts(&self) -> Result<Vec<ArtifactId>> {
        self.engine.store.input_ids(&self.id)
    }

    pub fn output_artifacts(&self) -> Result<BTreeMap<String, ArtifactId>> {
        self.engine.store.output_artifacts(&self.id)
    }

    /// Queue the job and hand it to the launcher.
    ///
    /// The status check, the pending-map check and the move to `queued` are a
    /// single atomic store operation; the actual launch runs in a detached
    /// task so submission returns immediately. A launch failure becomes a
    /// normal job failure via the completion path.
    pub async fn submit(&self) -> Result<()> {
        let command = self.engine.store.with_job_mut(&self.id, |record| {
            if !matches!(
                record.status,
                JobStatus::InConstruction | JobStatus::Waiting
            ) {
                return Err(Error::not_permitted(format!(
                    "can't submit job, not in 'in_construction' or 'waiting' status. \
                     Current status: {}",
                    record.status
                )));
            }
            if !record.pending.is_empty() {
                return Err(Error::not_permitted(format!(
                    "can't submit job '{}': parameters are still pending on unfinished \
                     parent jobs",
                    record.id
                )));
            }
            record.status = JobStatus::Queued;
            Ok(record.command.clone())
        })?;

        tracing::info!(job_id = %self.id, command = %command, "submitting job");
        let spec = LaunchSpec::new(&self.engine.config, self.id, command);
        let job = self.clone();
        tokio::spawn(async move { job.dispatch(spec).await });
        Ok(())
    }

    // Boxed signature: completion of a failed launch can submit and complete
    // further jobs, which makes the future self-referential.
    fn dispatch(
        &self,
        spec: LaunchSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(launch_err) = self.engine.launcher.launch(&spec).await {
                let message = format!("Error submitting job '{}':\n{launch_err:#}", self.id);
                tracing::error!(job_id = %self.id, "{message}");
                if let Err(err) = self.complete(false, None, Some(&message)).await {
                    tracing::error!(job_id = %self.id, error = %err, "failed to record launch error");
                }
            }
        })
    }

    /// Record a heartbeat from the running process. The first heartbeat moves
    /// a `queued` job to `running`; later ones only refresh the timestamp.
    pub fn update_heartbeat_state(&self) -> Result<()> {
        self.engine.store.with_job_mut(&self.id, |record| {
            match record.status {
                JobStatus::Queued => record.status = JobStatus::Running,
                JobStatus::Running => {}
                _ => {
                    return Err(Error::not_permitted(
                        "can't execute heartbeat on job: already completed",
                    ))
                }
            }
            record.heartbeat = Some(Utc::now());
            Ok(())
        })
    }

    /// Update the human-readable progress step of a running job.
    pub fn set_step(&self, step: &str) -> Result<()> {
        self.engine.store.with_job_mut(&self.id, |record| {
            if record.status != JobStatus::Running {
                return Err(Error::not_permitted(
                    "cannot change the step of a job whose status is not 'running'",
                ));
            }
            record.step = Some(step.to_string());
            Ok(())
        })
    }

    /// Finish the job.
    ///
    /// On success the reported output data is materialized into artifacts,
    /// children waiting on this job get their deferred parameters rewritten,
    /// and any child whose pending map drained is submitted. On failure the
    /// job and all its non-terminal descendants are marked `error`.
    pub async fn complete(
        &self,
        success: bool,
        artifacts_data: Option<BTreeMap<String, ArtifactData>>,
        error: Option<&str>,
    ) -> Result<()> {
        if !success {
            return self.fail(error.unwrap_or("Job failed"));
        }

        let record = self.record()?;
        if record.status != JobStatus::Running {
            return Err(Error::not_permitted(
                "can't complete job: not in a running state",
            ));
        }
        let spec = self.engine.require_command(&record.command)?;

        let artifacts_data = artifacts_data.unwrap_or_default();
        let mut outputs = BTreeMap::new();
        match spec.kind {
            CommandKind::ArtifactDefinition => {
                // Bootstraps the artifact graph: exactly one parentless
                // artifact, no provenance.
                if artifacts_data.len() != 1 {
                    return Err(Error::validation(format!(
                        "artifact definition job '{}' must produce exactly one artifact",
                        self.id
                    )));
                }
                for (name, data) in &artifacts_data {
                    self.require_output(&spec.outputs, name)?;
                    let artifact = self
                        .engine
                        .artifacts
                        .create_artifact(data, &[], None)
                        .await
                        .map_err(Error::Storage)?;
                    outputs.insert(name.clone(), artifact);
                }
            }
            CommandKind::Processing => {
                let parents = self.engine.store.input_ids(&self.id)?;
                let provenance = serde_json::to_value(&record.values)
                    .map_err(|err| Error::Storage(err.into()))?;
                for (name, data) in &artifacts_data {
                    self.require_output(&spec.outputs, name)?;
                    let artifact = self
                        .engine
                        .artifacts
                        .create_artifact(data, &parents, Some(&provenance))
                        .await
                        .map_err(Error::Storage)?;
                    outputs.insert(name.clone(), artifact);
                }
            }
        }

        let ready = self.engine.store.finish_success(&self.id, &outputs)?;
        tracing::info!(job_id = %self.id, ready = ready.len(), "job succeeded");
        for child in ready {
            self.engine.job(child).submit().await?;
        }
        Ok(())
    }

    fn require_output(&self, declared: &[String], name: &str) -> Result<()> {
        if !declared.iter().any(|o| o == name) {
            return Err(Error::validation(format!(
                "job '{}' declares no output named '{name}'",
                self.id
            )));
        }
        Ok(())
    }

    /// Mark the job failed and cascade the failure through its descendants.
    /// The worklist skips jobs that already reached a terminal status, so two
    /// cascades meeting at a shared descendant never fight over it.
    fn fail(&self, message: &str) -> Result<()> {
        match self.status()? {
            JobStatus::Success => {
                return Err(Error::not_permitted(
                    "cannot change the status of a 'success' job",
                ))
            }
            JobStatus::Error => {
                return Err(Error::not_permitted("can't complete job: already completed"))
            }
            _ => {}
        }

        let mut worklist = vec![(self.id, message.to_string())];
        while let Some((id, message)) = worklist.pop() {
            let Some(children) = self
                .engine
                .store
                .mark_error(&id, "Runtime error", &message)?
            else {
                continue;
            };
            tracing::warn!(job_id = %id, "job failed: {message}");
            for child in children {
                worklist.push((child, format!("Parent job '{id}' failed.")));
            }
        }
        Ok(())
    }
}
