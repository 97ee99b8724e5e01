use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskrunner_core::types::TaskRecord;
use tracing::info;

use crate::{
    error::{Result, StoreError},
    filter::TaskFilter,
    memory::MemoryStore,
    sqlite::SqliteStore,
    update::TaskUpdate,
};

/// Durable document store holding task records.
///
/// Every mutation that coordinates workers goes through
/// [`find_and_modify`](TaskStore::find_and_modify), which must select and
/// update a record in one atomic operation. Implementations must be
/// `Send + Sync` so one store can be shared by many workers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Short backend label for logs (e.g. `"sqlite"`).
    fn backend(&self) -> &'static str;

    /// Current time according to the store, at millisecond precision.
    ///
    /// Workers compare timestamps against this clock, never their own.
    async fn now(&self) -> Result<DateTime<Utc>>;

    /// Insert a new record. Fails with [`StoreError::Duplicate`] when the
    /// `taskId` is taken, leaving the existing record untouched.
    async fn insert(&self, task: &TaskRecord) -> Result<()>;

    /// Atomically pick the first matching record in FIFO order, apply
    /// `update` to it, and return the updated record.
    ///
    /// Returns `None` when nothing matches.
    async fn find_and_modify(
        &self,
        filter: &TaskFilter,
        update: &TaskUpdate,
    ) -> Result<Option<TaskRecord>>;

    /// Apply `update` to every matching record; returns how many changed.
    async fn update_many(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64>;

    /// All matching records in FIFO order.
    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>>;

    /// Delete every matching record; returns how many were removed.
    async fn remove(&self, filter: &TaskFilter) -> Result<u64>;

    /// Release the connection. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Open a store from a URI.
///
/// | URI                 | Backend                                  |
/// |---------------------|------------------------------------------|
/// | `sqlite://<path>`   | SQLite file, created if missing          |
/// | `sqlite::memory:`   | private in-memory SQLite database        |
/// | `memory://`         | [`MemoryStore`] (process-local)          |
pub async fn connect(uri: &str) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = if uri == "sqlite::memory:" {
        Arc::new(SqliteStore::open_in_memory()?)
    } else if let Some(path) = uri.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }
        ensure_parent_dir(path)?;
        let path = path.to_string();
        let sqlite = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Arc::new(sqlite)
    } else if uri == "memory://" {
        Arc::new(MemoryStore::new())
    } else {
        return Err(StoreError::InvalidUri(uri.to_string()));
    };

    info!(backend = store.backend(), %uri, "task store connected");
    Ok(store)
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        let err = connect("mongodb://localhost:27017/test").await.err();
        assert!(matches!(err, Some(StoreError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn connect_selects_backend_from_uri() {
        assert_eq!(connect("memory://").await.unwrap().backend(), "memory");
        assert_eq!(connect("sqlite::memory:").await.unwrap().backend(), "sqlite");
    }

    #[tokio::test]
    async fn connect_creates_missing_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        let uri = format!("sqlite://{}", path.display());
        let store = connect(&uri).await.unwrap();
        store.close().await.unwrap();
        assert!(path.exists());
    }
}
