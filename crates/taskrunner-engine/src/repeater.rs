//! Rescheduling of recurring tasks after a successful run.

use chrono::{DateTime, Duration, TimeZone, Utc};
use taskrunner_core::types::TaskRecord;
use taskrunner_store::{TaskFilter, TaskStore, TaskUpdate};
use tracing::info;

use crate::error::Result;

/// Next start time for a task that repeats every `repeat_every` seconds and
/// just finished at `now`.
///
/// Saturates at the last instant of year 9999, the latest time the stores'
/// fixed-width timestamp text can order correctly.
pub fn compute_next_start(repeat_every: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let limit = far_future();
    i64::try_from(repeat_every)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|every| now.checked_add_signed(every))
        .map_or(limit, |next| next.min(limit))
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The update applied to a recurring task after success: due again at
/// `next_start`, unlocked, error cleared and failure streak reset.
///
/// `processedAt` stays absent and `failedAt` is kept as history.
pub fn reschedule_update(next_start: DateTime<Utc>) -> TaskUpdate {
    TaskUpdate::new()
        .start_at(next_start)
        .unlock()
        .clear_processed()
        .clear_error()
        .reset_retries()
}

/// Push `task` to its next cycle. `guard` must select the claimed record
/// (id plus the `lockedAt` of the claim); returns `None` if the claim was
/// lost in the meantime.
pub async fn reschedule(
    store: &dyn TaskStore,
    guard: &TaskFilter,
    task: &TaskRecord,
    now: DateTime<Utc>,
) -> Result<Option<TaskRecord>> {
    let next_start = compute_next_start(task.repeat_every, now);
    let updated = store
        .find_and_modify(guard, &reschedule_update(next_start))
        .await?;
    if let Some(ref t) = updated {
        info!(task_id = %t.task_id, next_start = %t.start_at, "recurring task rescheduled");
    }
    Ok(updated)
}
