use std::sync::Arc;
use std::time::Duration;

use taskrunner_core::config::WorkerConfig;
use taskrunner_store::TaskStore;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    executor::{Executor, RunOutcome},
    handler::HandlerRegistry,
    locker::Locker,
};

/// One claim/execute poll loop.
///
/// Workers share nothing but the store, so any number of them (in one
/// process or many) can run against the same database.
pub struct Worker {
    id: String,
    registry: Arc<HandlerRegistry>,
    locker: Locker,
    executor: Executor,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            locker: Locker::new(store.clone(), config.stale_lock_threshold()),
            executor: Executor::new(store, registry.clone())
                .with_timeout(config.execution_timeout()),
            registry,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run at most one task.
    ///
    /// Only names with a registered handler are claimed.
    pub async fn run_once(&self) -> Result<Option<RunOutcome>> {
        let names = self.registry.names();
        let Some(task) = self.locker.claim_next_of(&self.id, &names).await? else {
            return Ok(None);
        };
        self.executor.run(task).await.map(Some)
    }

    /// Run tasks until none is eligible. Returns how many were run.
    ///
    /// Stops early after a failure so a task that keeps failing is retried
    /// once per poll rather than in a tight loop.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.run_once().await {
                Ok(None) => break,
                Ok(Some(RunOutcome::Failed(_))) => {
                    ran += 1;
                    break;
                }
                Ok(Some(_)) => ran += 1,
                Err(e) => {
                    error!(worker_id = %self.id, "worker poll error: {e}");
                    break;
                }
            }
        }
        ran
    }

    /// Poll until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, handlers = ?self.registry.names(), "worker started");
        if self.registry.is_empty() {
            warn!(worker_id = %self.id, "no handlers registered; nothing will be claimed");
        }

        if let Err(e) = self.locker.release_stale().await {
            error!(worker_id = %self.id, "stale lock release failed: {e}");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ran = self.drain().await;
                    if ran > 0 {
                        debug!(worker_id = %self.id, ran, "poll finished");
                    }
                }
                changed = shutdown.changed() => {
                    // a dropped sender can never signal again
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker_id = %self.id, "worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
