use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    /// A request was rejected before any work was scheduled.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The node filter expression is structurally invalid.
    #[error("invalid node filter: {message}")]
    InvalidNodeFilter { message: String },

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The task state machine does not allow this move.
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The site design could not be resolved or is unusable.
    #[error("design error: {message}")]
    Design { message: String },

    /// A driver step failed without retry.
    #[error("driver error in {action}: {message}")]
    Driver { action: String, message: String },

    /// A transient step kept failing until the retry budget ran out.
    #[error("max retries reached for {action} after {attempts} attempts")]
    MaxRetriesReached { action: String, attempts: u32 },

    /// Children did not all report back before the collection deadline.
    #[error("subtask collection timeout after {timeout:?} ({pending} unfinished)")]
    SubtaskCollectionTimeout { timeout: Duration, pending: usize },

    /// A bounded wait for a terminal status expired.
    #[error("timed out waiting for task {task_id}")]
    WaitTimeout { task_id: TaskId },

    /// A boot-action asset could not be rendered.
    #[error("render error: {message}")]
    Render { message: String },

    /// Building the asset archive failed.
    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidNodeFilter {
            message: message.into(),
        }
    }

    pub fn design(message: impl Into<String>) -> Self {
        Self::Design {
            message: message.into(),
        }
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render {
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
