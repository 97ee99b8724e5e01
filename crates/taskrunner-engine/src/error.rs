use taskrunner_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the scheduling and execution engine.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Rejected options, e.g. a group on a recurring task. Raised before
    /// anything is written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task with this id already exists.
    #[error("Duplicate task: {task_id}")]
    DuplicateTask { task_id: String },

    /// The store could not be reached or has been closed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// No handler is registered for the task's name.
    #[error("Handler not found: {name}")]
    HandlerNotFound { name: String },

    /// The handler ran and failed. Recorded on the task, not raised by the
    /// worker loop.
    #[error("Handler execution failed: {0}")]
    HandlerExecution(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate { task_id } => TaskError::DuplicateTask { task_id },
            e @ (StoreError::Closed | StoreError::Unavailable(_)) => {
                TaskError::StoreUnavailable(e.to_string())
            }
            other => TaskError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
