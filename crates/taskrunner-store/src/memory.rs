use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use taskrunner_core::types::TaskRecord;
use tracing::debug;

use crate::{
    error::{Result, StoreError},
    filter::{fifo_order, TaskFilter},
    group::held_groups,
    store::TaskStore,
    update::TaskUpdate,
};

/// Process-local [`TaskStore`] for tests and single-process embedding.
///
/// All records live behind one `Mutex`, so each call observes and mutates
/// a consistent snapshot; that is what makes `find_and_modify` atomic here.
/// The clock can be frozen and advanced to make time-dependent behaviour
/// (stale locks, recurrence) deterministic.
pub struct MemoryStore {
    tasks: Mutex<BTreeMap<String, TaskRecord>>,
    /// `None` follows the system clock.
    frozen_at: Mutex<Option<DateTime<Utc>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            frozen_at: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop the store clock at `at` (truncated to milliseconds).
    pub fn freeze_clock(&self, at: DateTime<Utc>) {
        *self.frozen_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(at.trunc_subsecs(3));
    }

    /// Move the clock forward by `by`, freezing it first if it was running.
    pub fn advance_clock(&self, by: Duration) {
        let mut frozen = self.frozen_at.lock().unwrap_or_else(|e| e.into_inner());
        let base = frozen.unwrap_or_else(|| Utc::now().trunc_subsecs(3));
        *frozen = Some(base + by);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current_time(&self) -> DateTime<Utc> {
        let frozen = *self.frozen_at.lock().unwrap_or_else(|e| e.into_inner());
        frozen.unwrap_or_else(|| Utc::now().trunc_subsecs(3))
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Ids of matching records in FIFO order.
fn matching_ids(tasks: &BTreeMap<String, TaskRecord>, filter: &TaskFilter) -> Vec<String> {
    let held: HashSet<String> = match filter.claimable {
        Some(window) => held_groups(tasks.values(), window.stale_before),
        None => HashSet::new(),
    };
    let mut matched: Vec<&TaskRecord> = tasks
        .values()
        .filter(|t| filter.matches(t, &held))
        .collect();
    matched.sort_by(|a, b| fifo_order(a, b));
    matched.into_iter().map(|t| t.task_id.clone()).collect()
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn now(&self) -> Result<DateTime<Utc>> {
        self.ensure_open()?;
        Ok(self.current_time())
    }

    async fn insert(&self, task: &TaskRecord) -> Result<()> {
        self.ensure_open()?;
        let mut tasks = self.lock_tasks();
        if tasks.contains_key(&task.task_id) {
            return Err(StoreError::Duplicate {
                task_id: task.task_id.clone(),
            });
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn find_and_modify(
        &self,
        filter: &TaskFilter,
        update: &TaskUpdate,
    ) -> Result<Option<TaskRecord>> {
        self.ensure_open()?;
        let mut tasks = self.lock_tasks();
        let Some(id) = matching_ids(&tasks, filter).into_iter().next() else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        update.apply(task);
        debug!(task_id = %id, "find_and_modify matched");
        Ok(Some(task.clone()))
    }

    async fn update_many(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64> {
        self.ensure_open()?;
        if update.is_empty() {
            return Ok(0);
        }
        let mut tasks = self.lock_tasks();
        let ids = matching_ids(&tasks, filter);
        for id in &ids {
            if let Some(task) = tasks.get_mut(id) {
                update.apply(task);
            }
        }
        Ok(ids.len() as u64)
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        self.ensure_open()?;
        let tasks = self.lock_tasks();
        Ok(matching_ids(&tasks, filter)
            .into_iter()
            .filter_map(|id| tasks.get(&id).cloned())
            .collect())
    }

    async fn remove(&self, filter: &TaskFilter) -> Result<u64> {
        self.ensure_open()?;
        let mut tasks = self.lock_tasks();
        let ids = matching_ids(&tasks, filter);
        for id in &ids {
            tasks.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
