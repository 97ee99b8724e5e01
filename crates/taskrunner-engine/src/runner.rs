use std::sync::Arc;

use taskrunner_core::{
    config::WorkerConfig,
    types::{TaskOptions, TaskRecord},
};
use taskrunner_store::{TaskFilter, TaskStore};
use tracing::info;

use crate::{error::Result, handler::HandlerRegistry, scheduler::Scheduler, worker::Worker};

/// Entry point for embedding applications: one store, a scheduler on top
/// of it, and workers created on demand.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    scheduler: Scheduler,
}

impl TaskRunner {
    /// Open the store named by `uri` (see [`taskrunner_store::connect`]).
    pub async fn connect(uri: &str) -> Result<Self> {
        let store = taskrunner_store::connect(uri).await?;
        Ok(Self::new(store))
    }

    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub async fn schedule(
        &self,
        name: &str,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Result<TaskRecord> {
        self.scheduler.schedule(name, data, options).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .store
            .find(&TaskFilter::by_id(task_id))
            .await?
            .into_iter()
            .next())
    }

    /// Matching records in claim order.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        Ok(self.store.find(filter).await?)
    }

    /// Delete matching records. Removing a claimed task does not stop the
    /// handler already running it; its result write simply finds nothing.
    pub async fn remove(&self, filter: &TaskFilter) -> Result<u64> {
        let removed = self.store.remove(filter).await?;
        info!(count = removed, "tasks removed");
        Ok(removed)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.store.close().await?)
    }

    /// A worker polling this runner's store.
    pub fn worker(
        &self,
        id: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Worker {
        Worker::new(id, self.store.clone(), registry, config)
    }
}
