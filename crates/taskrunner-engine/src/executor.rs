use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use taskrunner_core::types::TaskRecord;
use taskrunner_store::{TaskFilter, TaskStore, TaskUpdate};
use tracing::{info, instrument, warn};

use crate::{
    error::{Result, TaskError},
    handler::{HandlerRegistry, TaskHandler},
    repeater,
};

/// How one claimed task ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// One-shot task finished; `processedAt` is set.
    Completed(TaskRecord),
    /// Recurring task finished and is due again at its new `startAt`.
    Rescheduled(TaskRecord),
    /// Handler failed; the task is unlocked and will be retried.
    Failed(TaskRecord),
    /// The claim went stale and another worker took the task over before
    /// the result could be written. Nothing was recorded.
    LockLost { task_id: String },
}

impl RunOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            RunOutcome::Completed(t) | RunOutcome::Rescheduled(t) | RunOutcome::Failed(t) => {
                &t.task_id
            }
            RunOutcome::LockLost { task_id } => task_id,
        }
    }
}

/// Runs claimed tasks through their handlers and records the result.
pub struct Executor {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            timeout: None,
        }
    }

    /// Treat handler runs longer than `timeout` as failures.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a task returned by the locker.
    ///
    /// Every write is conditioned on the task still carrying the `lockedAt`
    /// of this claim. Handler failures are recorded and reported through
    /// [`RunOutcome::Failed`]; only store problems and a missing handler
    /// come back as `Err`.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, name = %task.name))]
    pub async fn run(&self, task: TaskRecord) -> Result<RunOutcome> {
        let guard = TaskFilter::by_id(task.task_id.as_str()).locked_at(task.locked_at);

        let Some(handler) = self.registry.get(&task.name) else {
            // give the task back untouched so a worker that knows it can run it
            self.store
                .find_and_modify(&guard, &TaskUpdate::new().unlock())
                .await?;
            warn!("no handler registered, claim released");
            return Err(TaskError::HandlerNotFound { name: task.name });
        };

        let result = self.invoke(handler, &task).await;
        let now = self.store.now().await?;

        let written = match result {
            Ok(()) if task.is_recurring() => {
                return Ok(
                    match repeater::reschedule(self.store.as_ref(), &guard, &task, now).await? {
                        Some(updated) => RunOutcome::Rescheduled(updated),
                        None => lock_lost(task.task_id),
                    },
                );
            }
            Ok(()) => {
                let update = TaskUpdate::new().processed(now).clear_error();
                self.store
                    .find_and_modify(&guard, &update)
                    .await?
                    .map(RunOutcome::Completed)
            }
            Err(TaskError::HandlerExecution(message)) => {
                warn!(attempt = task.retries + 1, error = %message, "task failed");
                let update = TaskUpdate::new()
                    .failed(now, message)
                    .increment_retries()
                    .unlock();
                self.store
                    .find_and_modify(&guard, &update)
                    .await?
                    .map(RunOutcome::Failed)
            }
            Err(other) => return Err(other),
        };

        match written {
            Some(outcome @ RunOutcome::Completed(_)) => {
                info!("task completed");
                Ok(outcome)
            }
            Some(outcome) => Ok(outcome),
            None => Ok(lock_lost(task.task_id)),
        }
    }

    /// Run the handler on its own task so a panic or an overrun is contained.
    async fn invoke(&self, handler: Arc<dyn TaskHandler>, task: &TaskRecord) -> Result<()> {
        let owned = task.clone();
        let mut join = tokio::spawn(async move { handler.handle(&owned).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return Err(TaskError::HandlerExecution(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => join.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskError::HandlerExecution(format!("{e:#}"))),
            Err(e) if e.is_panic() => Err(TaskError::HandlerExecution(format!(
                "handler panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(e) => Err(TaskError::HandlerExecution(e.to_string())),
        }
    }
}

fn lock_lost(task_id: String) -> RunOutcome {
    warn!(%task_id, "claim lost before result was recorded");
    RunOutcome::LockLost { task_id }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
