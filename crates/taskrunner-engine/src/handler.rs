use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use taskrunner_core::types::TaskRecord;
use tracing::debug;

/// Work performed for every task with a given name.
///
/// Returning `Err` marks the attempt as failed; the error's display text
/// (with its cause chain) becomes the task's `errorMsg`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()>;
}

/// Adapter that lets an async closure act as a [`TaskHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        (self.0)(task.clone()).await
    }
}

/// Name → handler lookup shared by a process's workers.
///
/// Share it as `Arc<HandlerRegistry>`; registration may happen while
/// workers are running.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: impl TaskHandler) {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        debug!(%name, "handler registered");
        handlers.insert(name, Arc::new(handler));
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Remove a handler. Silent no-op if the name is not registered.
    pub fn unregister(&self, name: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.remove(name).is_some() {
            debug!(name, "handler unregistered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
