use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `lockedAt` value of a task that no worker holds.
///
/// The sentinel is a real timestamp rather than a missing field so the
/// persisted layout is the same for locked and unlocked records.
pub const UNLOCKED: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// A persisted unit of schedulable work.
///
/// Field names serialize in camelCase (`taskId`, `repeatEvery`, …) and
/// absent optionals serialize as `null`, matching the stored layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique key, caller-supplied or a generated UUID v4 string.
    pub task_id: String,
    /// Logical task type; selects the handler.
    pub name: String,
    /// Opaque handler input, passed through unmodified.
    pub data: serde_json::Value,
    /// Serialization group. Never set together with `repeat_every > 0`.
    pub group: Option<String>,
    /// Recurrence interval in seconds; 0 means one-shot.
    pub repeat_every: u64,
    /// Earliest time the task may be claimed.
    pub start_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Time of the current or last claim; [`UNLOCKED`] when free.
    pub locked_at: DateTime<Utc>,
    /// Set once a one-shot task has succeeded. Recurring tasks never set it.
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    /// Number of failed attempts.
    pub retries: u32,
}

impl TaskRecord {
    /// A fresh pending record: unlocked, never run, due at `now`.
    pub fn new(
        task_id: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            data,
            group: None,
            repeat_every: 0,
            start_at: now,
            created_at: now,
            locked_at: UNLOCKED,
            processed_at: None,
            failed_at: None,
            error_msg: None,
            retries: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at != UNLOCKED
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat_every > 0
    }

    /// True when the record holds a lock taken at or after `stale_before`,
    /// i.e. a claim that is still considered live.
    pub fn holds_active_lock(&self, stale_before: DateTime<Utc>) -> bool {
        !self.is_processed() && self.is_locked() && self.locked_at >= stale_before
    }
}

/// Optional knobs accepted by `schedule`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    pub task_id: Option<String>,
    pub group: Option<String>,
    /// Seconds between runs of a recurring task.
    pub repeat_every: Option<u64>,
    pub start_at: Option<DateTime<Utc>>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn repeat_every(mut self, secs: u64) -> Self {
        self.repeat_every = Some(secs);
        self
    }

    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }
}
