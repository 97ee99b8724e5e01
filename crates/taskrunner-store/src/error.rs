use thiserror::Error;

/// Errors raised by a [`TaskStore`](crate::TaskStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same `taskId` already exists.
    #[error("Duplicate task id: {task_id}")]
    Duplicate { task_id: String },

    /// Another writer holds the database; the operation did not run.
    #[error("Store contention: {0}")]
    Contention(String),

    /// The backend cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store was closed via [`TaskStore::close`](crate::TaskStore::close).
    #[error("Store is closed")]
    Closed,

    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Contention(e.to_string())
            }
            Some(rusqlite::ErrorCode::CannotOpen) => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Database(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
