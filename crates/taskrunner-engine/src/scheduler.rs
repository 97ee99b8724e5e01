use std::sync::Arc;

use chrono::{Datelike, SubsecRound};
use taskrunner_core::types::{TaskOptions, TaskRecord};
use taskrunner_store::TaskStore;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{Result, TaskError};

pub const GROUP_ON_REPEATABLE: &str = "Can not specify group for repeatable task";

/// Years a stored timestamp can hold as fixed-width RFC 3339 text.
const STORABLE_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

/// Creates new task records.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Validate `options`, then insert a fresh pending task.
    ///
    /// Returns the record exactly as persisted, including the generated
    /// `task_id` and timestamps. Uniqueness of `task_id` is enforced by the
    /// store's key constraint, so concurrent schedulers cannot both win.
    #[instrument(skip(self, data, options), fields(task_id))]
    pub async fn schedule(
        &self,
        name: &str,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Result<TaskRecord> {
        validate(name, &options)?;

        let now = self.store.now().await?;
        let task_id = options
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("task_id", task_id.as_str());

        let mut task = TaskRecord::new(task_id, name, data, now);
        task.group = options.group;
        task.repeat_every = options.repeat_every.unwrap_or(0);
        // the store keeps millisecond precision; hand back what it keeps
        if let Some(start_at) = options.start_at {
            task.start_at = start_at.trunc_subsecs(3);
        }

        self.store.insert(&task).await?;

        info!(
            name = %task.name,
            group = task.group.as_deref().unwrap_or("-"),
            repeat_every = task.repeat_every,
            start_at = %task.start_at,
            "task scheduled"
        );
        Ok(task)
    }
}

/// Reject option combinations before anything touches the store.
pub fn validate(name: &str, options: &TaskOptions) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TaskError::Validation("task name must not be empty".into()));
    }
    if options.task_id.as_deref().is_some_and(str::is_empty) {
        return Err(TaskError::Validation("task id must not be empty".into()));
    }
    if options.group.as_deref().is_some_and(str::is_empty) {
        return Err(TaskError::Validation("group must not be empty".into()));
    }
    if options.group.is_some() && options.repeat_every.unwrap_or(0) > 0 {
        return Err(TaskError::Validation(GROUP_ON_REPEATABLE.into()));
    }
    if options
        .repeat_every
        .is_some_and(|secs| i64::try_from(secs).is_err())
    {
        return Err(TaskError::Validation(format!(
            "repeat interval must not exceed {} seconds",
            i64::MAX
        )));
    }
    if let Some(start_at) = options.start_at {
        if !STORABLE_YEARS.contains(&start_at.year()) {
            return Err(TaskError::Validation(format!(
                "start time {start_at} must fall within years 0000-9999"
            )));
        }
    }
    Ok(())
}
