//! Group serialization rule.
//!
//! A grouped record is claimable only while no other record of the same
//! group holds an active lock. The rule is part of the claim predicate so
//! that checking the group and taking the lock happen in one atomic store
//! operation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use taskrunner_core::types::TaskRecord;

/// SQL form of the rule, evaluated against the candidate row `cand`.
///
/// Binds two parameters: the unlocked sentinel, then the stale cutoff.
pub const GROUP_ELIGIBLE_SQL: &str = "(cand.task_group IS NULL OR NOT EXISTS (
        SELECT 1 FROM tasks AS held
        WHERE held.task_group = cand.task_group
          AND held.task_id <> cand.task_id
          AND held.processed_at IS NULL
          AND held.locked_at <> ?
          AND held.locked_at >= ?))";

/// Groups with at least one live (unprocessed, non-stale) lock.
pub fn held_groups<'a, I>(tasks: I, stale_before: DateTime<Utc>) -> HashSet<String>
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    tasks
        .into_iter()
        .filter(|t| t.holds_active_lock(stale_before))
        .filter_map(|t| t.group.clone())
        .collect()
}
