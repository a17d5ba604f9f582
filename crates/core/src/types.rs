use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a materialized artifact
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an error log entry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogId(pub Uuid);

impl LogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job.
///
/// A job is created `in_construction`, becomes `waiting` when its workflow is
/// submitted while it still has unresolved ancestors, `queued` once it is
/// handed to the launcher, `running` on its first heartbeat, and ends in
/// `success` or `error` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InConstruction,
    Waiting,
    Queued,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::InConstruction => "in_construction",
            JobStatus::Waiting => "waiting",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// Whether moving from `self` to `to` is a legal edge of the job state
    /// machine. `error` is reachable from any non-terminal status; a running
    /// job can never rewind to `queued`.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (InConstruction, Waiting)
            | (InConstruction, Queued)
            | (Waiting, Queued)
            | (Queued, Running)
            | (Running, Success) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value bound to a single command parameter.
///
/// `Deferred` names the output of another job in the same workflow that has
/// not run yet; it is tracked in the job's pending map until the producer
/// completes and the value is rewritten to a concrete `Artifact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamValue {
    Scalar { value: serde_json::Value },
    Artifact { id: ArtifactId },
    Deferred { producer: JobId, output: String },
}

/// Unresolved parameters, keyed by producing job id. The inner map goes from
/// parameter name to the producer's output name.
pub type PendingMap = BTreeMap<JobId, BTreeMap<String, String>>;

/// A concrete parameter set for one command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub command: String,
    pub values: BTreeMap<String, ParamValue>,
}

impl Parameters {
    pub fn new(command: impl Into<String>, values: BTreeMap<String, ParamValue>) -> Self {
        Self {
            command: command.into(),
            values,
        }
    }

    /// Merge a default parameter set with optional overrides and required
    /// values. Required values win over optional ones, which win over the
    /// defaults.
    pub fn from_defaults(
        defaults: &DefaultParameters,
        required: Option<&BTreeMap<String, ParamValue>>,
        optional: Option<&BTreeMap<String, ParamValue>>,
    ) -> Self {
        let mut values = defaults.values.clone();
        if let Some(optional) = optional {
            for (name, value) in optional {
                values.insert(name.clone(), value.clone());
            }
        }
        if let Some(required) = required {
            for (name, value) in required {
                values.insert(name.clone(), value.clone());
            }
        }
        Self {
            command: defaults.command.clone(),
            values,
        }
    }
}

/// Default parameter set registered for a command, the starting point for
/// jobs added to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultParameters {
    pub command: String,
    #[serde(default)]
    pub values: BTreeMap<String, ParamValue>,
}

impl DefaultParameters {
    pub fn new(command: impl Into<String>, values: BTreeMap<String, ParamValue>) -> Self {
        Self {
            command: command.into(),
            values,
        }
    }
}

/// Persisted state of a job. This record is the single source of truth; the
/// [`Job`](crate::job::Job) handle re-reads it for every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: String,
    pub command: String,
    pub values: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub pending: PendingMap,
    pub status: JobStatus,
    pub heartbeat: Option<DateTime<Utc>>,
    pub step: Option<String>,
    pub log: Option<LogId>,
    pub created_at: DateTime<Utc>,
}

/// Persisted state of a workflow. Root membership and parent→child edges
/// live in their own tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub owner: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Error log entry attached to a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: LogId,
    pub category: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        for to in [
            JobStatus::InConstruction,
            JobStatus::Waiting,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Error,
        ] {
            assert!(!JobStatus::Success.can_transition(to));
            assert!(!JobStatus::Error.can_transition(to));
        }
    }

    #[test]
    fn running_cannot_rewind_to_queued() {
        assert!(!JobStatus::Running.can_transition(JobStatus::Queued));
    }

    #[test]
    fn error_reachable_from_any_non_terminal() {
        for from in [
            JobStatus::InConstruction,
            JobStatus::Waiting,
            JobStatus::Queued,
            JobStatus::Running,
        ] {
            assert!(from.can_transition(JobStatus::Error));
        }
    }

    #[test]
    fn from_defaults_precedence() {
        let defaults = DefaultParameters::new(
            "pick-otus",
            [
                (
                    "similarity".to_string(),
                    ParamValue::Scalar { value: 0.97.into() },
                ),
                (
                    "threads".to_string(),
                    ParamValue::Scalar { value: 1.into() },
                ),
            ]
            .into(),
        );
        let optional: BTreeMap<_, _> = [(
            "threads".to_string(),
            ParamValue::Scalar { value: 4.into() },
        )]
        .into();
        let required: BTreeMap<_, _> = [(
            "similarity".to_string(),
            ParamValue::Scalar { value: 0.99.into() },
        )]
        .into();

        let params = Parameters::from_defaults(&defaults, Some(&required), Some(&optional));
        assert_eq!(
            params.values["similarity"],
            ParamValue::Scalar { value: 0.99.into() }
        );
        assert_eq!(
            params.values["threads"],
            ParamValue::Scalar { value: 4.into() }
        );
    }

    #[test]
    fn pending_map_round_trips_through_json() {
        let producer = JobId::new();
        let mut record = PendingMap::new();
        record
            .entry(producer)
            .or_default()
            .insert("input".to_string(), "demultiplexed".to_string());

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: PendingMap = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded[&producer]["input"], "demultiplexed");
    }
}
