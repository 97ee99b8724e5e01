use chrono::{DateTime, Utc};
use taskrunner_core::types::{TaskRecord, UNLOCKED};

/// Change to an optional field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T: Clone> Field<T> {
    fn apply(&self, slot: &mut Option<T>) {
        match self {
            Field::Keep => {}
            Field::Set(v) => *slot = Some(v.clone()),
            Field::Clear => *slot = None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetriesUpdate {
    #[default]
    Keep,
    Increment,
    Reset,
}

/// Set of field assignments applied atomically to a matched record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub locked_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub processed_at: Field<DateTime<Utc>>,
    pub failed_at: Field<DateTime<Utc>>,
    pub error_msg: Field<String>,
    pub retries: RetriesUpdate,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(mut self, at: DateTime<Utc>) -> Self {
        self.locked_at = Some(at);
        self
    }

    /// Reset `lockedAt` to the unlocked sentinel.
    pub fn unlock(self) -> Self {
        self.lock(UNLOCKED)
    }

    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn processed(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Field::Set(at);
        self
    }

    pub fn clear_processed(mut self) -> Self {
        self.processed_at = Field::Clear;
        self
    }

    /// Record a failure: `failedAt` and `errorMsg`.
    pub fn failed(mut self, at: DateTime<Utc>, message: impl Into<String>) -> Self {
        self.failed_at = Field::Set(at);
        self.error_msg = Field::Set(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_msg = Field::Clear;
        self
    }

    pub fn increment_retries(mut self) -> Self {
        self.retries = RetriesUpdate::Increment;
        self
    }

    pub fn reset_retries(mut self) -> Self {
        self.retries = RetriesUpdate::Reset;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the assignments to an in-memory record.
    pub fn apply(&self, task: &mut TaskRecord) {
        if let Some(at) = self.locked_at {
            task.locked_at = at;
        }
        if let Some(at) = self.start_at {
            task.start_at = at;
        }
        self.processed_at.apply(&mut task.processed_at);
        self.failed_at.apply(&mut task.failed_at);
        self.error_msg.apply(&mut task.error_msg);
        match self.retries {
            RetriesUpdate::Keep => {}
            RetriesUpdate::Increment => task.retries = task.retries.saturating_add(1),
            RetriesUpdate::Reset => task.retries = 0,
        }
    }
}
