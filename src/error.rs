//! Error types for task setup and execution.

use thiserror::Error;

use crate::types::TaskState;

/// Errors surfaced by the setup coordinator and task runner.
///
/// Only `Cancelled` is expected during normal operation; transient material
/// shortages and collaborator failures are retried where they occur.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was cancelled or its setup session was retired.
    #[error("task cancelled")]
    Cancelled,

    /// A lifecycle operation was invoked in a state that does not allow it.
    #[error("cannot {operation} while task is {state}")]
    InvalidState {
        operation: &'static str,
        state: TaskState,
    },

    /// The task definition failed to load or validate.
    #[error("invalid task definition: {0}")]
    Config(String),

    /// A bounded run hit its deadline before the requested cycles finished.
    #[error("stopped after {completed} of {requested} cycles")]
    Incomplete { completed: u64, requested: u64 },
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Failures reported by world collaborators (crafting, placement).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("unknown craft command: {0}")]
    UnknownCommand(String),

    #[error("missing materials for {0}")]
    MissingMaterials(String),

    #[error("placement rejected: {0}")]
    PlacementRejected(String),
}

/// Result type alias for task operations.
pub type Result<T> = std::result::Result<T, TaskError>;
