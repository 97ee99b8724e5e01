use std::collections::HashSet;

use chrono::{DateTime, Utc};
use taskrunner_core::types::{TaskRecord, UNLOCKED};

/// Instants that bound a claim: what is due, and which locks are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimWindow {
    /// Store time of the claim attempt.
    pub now: DateTime<Utc>,
    /// Locks taken before this instant are abandoned.
    pub stale_before: DateTime<Utc>,
}

/// Conjunctive predicate over task records.
///
/// Every populated field must hold for a record to match; an empty filter
/// matches everything. Backends translate it to their own query language.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub task_id: Option<String>,
    /// Match any of these names. An empty list matches nothing.
    pub names: Option<Vec<String>>,
    pub group: Option<String>,
    /// Exact `lockedAt` value, used to guard writes by the claim they follow.
    pub locked_at: Option<DateTime<Utc>>,
    /// `Some(true)` → `processedAt` set, `Some(false)` → absent.
    pub processed: Option<bool>,
    /// Due, unprocessed, unlocked-or-stale and group-eligible.
    pub claimable: Option<ClaimWindow>,
    /// Unprocessed records locked before this instant.
    pub stale_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    /// Records a worker may claim at `now`, treating locks taken before
    /// `stale_before` as abandoned.
    pub fn claimable(now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Self {
        Self {
            claimable: Some(ClaimWindow { now, stale_before }),
            ..Self::default()
        }
    }

    /// Unprocessed records whose lock was taken before `stale_before`.
    pub fn stale_locks(stale_before: DateTime<Utc>) -> Self {
        Self {
            stale_before: Some(stale_before),
            ..Self::default()
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_names([name.into()])
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn locked_at(mut self, at: DateTime<Utc>) -> Self {
        self.locked_at = Some(at);
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    /// Evaluate the filter against one record.
    ///
    /// `held_groups` lists the groups that currently hold an active lock
    /// (see [`crate::group::held_groups`]); it is only consulted for the
    /// `claimable` predicate.
    pub fn matches(&self, task: &TaskRecord, held_groups: &HashSet<String>) -> bool {
        if self.task_id.as_ref().is_some_and(|id| *id != task.task_id) {
            return false;
        }
        if self
            .names
            .as_ref()
            .is_some_and(|names| !names.contains(&task.name))
        {
            return false;
        }
        if self.group.is_some() && self.group != task.group {
            return false;
        }
        if self.locked_at.is_some_and(|at| at != task.locked_at) {
            return false;
        }
        if self.processed.is_some_and(|p| p != task.is_processed()) {
            return false;
        }
        if let Some(window) = self.claimable {
            if !is_claimable(task, window, held_groups) {
                return false;
            }
        }
        if let Some(cutoff) = self.stale_before {
            if task.is_processed() || !task.is_locked() || task.locked_at >= cutoff {
                return false;
            }
        }
        true
    }
}

fn is_claimable(task: &TaskRecord, window: ClaimWindow, held_groups: &HashSet<String>) -> bool {
    if task.start_at > window.now || task.is_processed() {
        return false;
    }
    if task.locked_at != UNLOCKED && task.locked_at >= window.stale_before {
        return false;
    }
    match &task.group {
        Some(group) => !held_groups.contains(group),
        None => true,
    }
}

/// FIFO ordering among eligible records: `startAt`, then `createdAt`,
/// then `taskId`.
pub fn fifo_order(a: &TaskRecord, b: &TaskRecord) -> std::cmp::Ordering {
    a.start_at
        .cmp(&b.start_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.task_id.cmp(&b.task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn task(id: &str, start: i64) -> TaskRecord {
        let mut t = TaskRecord::new(id, "job", json!(null), at(0));
        t.start_at = at(start);
        t
    }

    #[test]
    fn claimable_requires_due_start() {
        let filter = TaskFilter::claimable(at(10), at(-300));
        let none = HashSet::new();
        assert!(filter.matches(&task("a", 10), &none));
        assert!(!filter.matches(&task("b", 11), &none));
    }

    #[test]
    fn claimable_skips_fresh_lock_but_takes_stale_one() {
        let filter = TaskFilter::claimable(at(100), at(40));
        let none = HashSet::new();
        let mut t = task("a", 0);
        t.locked_at = at(50);
        assert!(!filter.matches(&t, &none));
        t.locked_at = at(39);
        assert!(filter.matches(&t, &none));
    }

    #[test]
    fn claimable_excludes_processed() {
        let filter = TaskFilter::claimable(at(100), at(0));
        let mut t = task("a", 0);
        t.processed_at = Some(at(5));
        assert!(!filter.matches(&t, &HashSet::new()));
    }

    #[test]
    fn held_group_blocks_member() {
        let filter = TaskFilter::claimable(at(100), at(0));
        let mut t = task("a", 0);
        t.group = Some("g".to_string());
        let held: HashSet<String> = ["g".to_string()].into();
        assert!(!filter.matches(&t, &held));
        assert!(filter.matches(&t, &HashSet::new()));
    }

    #[test]
    fn empty_name_list_matches_nothing() {
        let filter = TaskFilter::all().with_names(Vec::<String>::new());
        assert!(!filter.matches(&task("a", 0), &HashSet::new()));
    }

    #[test]
    fn stale_filter_ignores_unlocked_and_processed() {
        let filter = TaskFilter::stale_locks(at(50));
        let none = HashSet::new();
        let mut t = task("a", 0);
        assert!(!filter.matches(&t, &none));
        t.locked_at = at(10);
        assert!(filter.matches(&t, &none));
        t.processed_at = Some(at(11));
        assert!(!filter.matches(&t, &none));
    }

    #[test]
    fn fifo_breaks_ties_by_creation_then_id() {
        let mut a = task("b", 0);
        let mut b = task("a", 0);
        assert_eq!(fifo_order(&a, &b), std::cmp::Ordering::Greater);
        a.created_at = at(-1);
        assert_eq!(fifo_order(&a, &b), std::cmp::Ordering::Less);
        b.start_at = at(-5);
        assert_eq!(fifo_order(&a, &b), std::cmp::Ordering::Greater);
    }
}
