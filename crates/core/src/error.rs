use crate::types::{JobId, WorkflowId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy of the orchestration engine.
///
/// `OperationNotPermitted` and `Validation` are raised synchronously to the
/// caller; launch failures never surface here, they are converted into a
/// normal job failure so they flow through the cascading-failure path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested state transition or mutation is illegal for the current
    /// status of the job or workflow.
    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),

    /// Structurally invalid input: mismatched template parameters, undeclared
    /// command parameters, cyclic graphs.
    #[error("{0}")]
    Validation(String),

    #[error("job '{0}' does not exist")]
    JobNotFound(JobId),

    #[error("workflow '{0}' does not exist")]
    WorkflowNotFound(WorkflowId),

    #[error("command '{0}' is not registered")]
    UnknownCommand(String),

    /// Storage layer failure (redb, serialization).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn not_permitted(message: impl Into<String>) -> Self {
        Self::OperationNotPermitted(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
