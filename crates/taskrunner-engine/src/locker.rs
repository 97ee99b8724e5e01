use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskrunner_core::types::TaskRecord;
use taskrunner_store::{StoreError, TaskFilter, TaskStore, TaskUpdate};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;

/// Claims due tasks for workers.
///
/// A claim is one `find_and_modify` against the store: the eligibility
/// check (due, unprocessed, unlocked or stale, group free) and setting
/// `lockedAt` happen atomically, so two workers never hold the same task.
pub struct Locker {
    store: Arc<dyn TaskStore>,
    stale_lock_threshold: Duration,
}

impl Locker {
    pub fn new(store: Arc<dyn TaskStore>, stale_lock_threshold: Duration) -> Self {
        Self {
            store,
            stale_lock_threshold,
        }
    }

    pub fn stale_lock_threshold(&self) -> Duration {
        self.stale_lock_threshold
    }

    /// Claim the next eligible task of any name.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        self.claim(worker_id, None).await
    }

    /// Claim the next eligible task whose name is in `names`.
    pub async fn claim_next_of(
        &self,
        worker_id: &str,
        names: &[String],
    ) -> Result<Option<TaskRecord>> {
        self.claim(worker_id, Some(names)).await
    }

    #[instrument(skip(self, names), fields(worker_id = %worker_id))]
    async fn claim(&self, worker_id: &str, names: Option<&[String]>) -> Result<Option<TaskRecord>> {
        let now = self.store.now().await?;
        let mut filter = TaskFilter::claimable(now, self.stale_before(now));
        if let Some(names) = names {
            filter = filter.with_names(names.iter().cloned());
        }

        match self
            .store
            .find_and_modify(&filter, &TaskUpdate::new().lock(now))
            .await
        {
            Ok(Some(task)) => {
                info!(
                    task_id = %task.task_id,
                    name = %task.name,
                    attempt = task.retries + 1,
                    "task claimed"
                );
                Ok(Some(task))
            }
            Ok(None) => {
                debug!("no eligible task");
                Ok(None)
            }
            // Another writer got there first; nothing claimed this round.
            Err(StoreError::Contention(reason)) => {
                debug!(%reason, "claim lost to contention");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reset every stale lock to unlocked. Returns how many were released.
    ///
    /// Claiming already treats stale locks as free; releasing them also
    /// frees their groups for tasks queued behind them.
    pub async fn release_stale(&self) -> Result<u64> {
        let now = self.store.now().await?;
        let released = self
            .store
            .update_many(
                &TaskFilter::stale_locks(self.stale_before(now)),
                &TaskUpdate::new().unlock(),
            )
            .await?;
        if released > 0 {
            warn!(count = released, "stale task locks released");
        }
        Ok(released)
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.stale_lock_threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
