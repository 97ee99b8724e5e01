//! Concurrency and eligibility tests for task claiming.
//!
//! The central property: however many workers race, a due task is held by
//! at most one of them, and a group never has two live claims.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};
use serde_json::json;
use taskrunner_core::{TaskOptions, UNLOCKED};
use taskrunner_engine::{Locker, Scheduler};
use taskrunner_store::{MemoryStore, SqliteStore, TaskFilter, TaskStore};
use tokio::sync::Barrier;

const STALE: i64 = 300;

fn frozen_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.freeze_clock(Utc::now().trunc_subsecs(3));
    store
}

async fn seed(store: Arc<dyn TaskStore>, count: usize) -> HashSet<String> {
    let scheduler = Scheduler::new(store);
    let mut ids = HashSet::new();
    for i in 0..count {
        let task = scheduler
            .schedule(
                "job",
                json!({ "n": i }),
                TaskOptions::new().with_task_id(format!("task-{i:02}")),
            )
            .await
            .unwrap();
        ids.insert(task.task_id);
    }
    ids
}

async fn seed_group(store: Arc<dyn TaskStore>, group: &str, count: usize) {
    let scheduler = Scheduler::new(store);
    for i in 0..count {
        scheduler
            .schedule(
                "job",
                json!({ "n": i }),
                TaskOptions::new()
                    .with_task_id(format!("{group}-{i:02}"))
                    .in_group(group),
            )
            .await
            .unwrap();
    }
}

/// Race `lockers.len()` claimers and return every id each of them got.
async fn race(lockers: Vec<Locker>, attempts: usize) -> Vec<String> {
    let barrier = Arc::new(Barrier::new(lockers.len()));
    let mut handles = Vec::new();
    for (n, locker) in lockers.into_iter().enumerate() {
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{n}");
            barrier.wait().await;
            let mut claimed = Vec::new();
            for _ in 0..attempts {
                if let Some(task) = locker.claim_next(&worker_id).await.unwrap() {
                    claimed.push(task.task_id);
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

fn assert_no_duplicates(claimed: &[String]) {
    let mut seen = HashSet::new();
    for id in claimed {
        assert!(seen.insert(id), "task {id} was claimed twice");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_duplicate_in_memory() {
    const TASKS: usize = 20;
    const WORKERS: usize = 10;

    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let ids = seed(store.clone(), TASKS).await;

    let lockers = (0..WORKERS)
        .map(|_| Locker::new(store.clone(), Duration::seconds(STALE)))
        .collect();
    let claimed = race(lockers, TASKS).await;

    assert_no_duplicates(&claimed);
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_duplicate_across_sqlite_connections() {
    const TASKS: usize = 20;
    const WORKERS: usize = 6;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let path = path.to_str().unwrap();

    let seed_store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(path).unwrap());
    let ids = seed(seed_store.clone(), TASKS).await;

    // one connection per worker, as separate processes would have
    let lockers = (0..WORKERS)
        .map(|_| {
            let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(path).unwrap());
            Locker::new(store, Duration::seconds(STALE))
        })
        .collect();
    let mut claimed = race(lockers, TASKS).await;
    assert_no_duplicates(&claimed);

    // claims lost to contention are simply left for later
    let sweeper = Locker::new(seed_store, Duration::seconds(STALE));
    while let Some(task) = sweeper.claim_next("sweeper").await.unwrap() {
        claimed.push(task.task_id);
    }
    assert_no_duplicates(&claimed);
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_take_one_task_per_group_across_sqlite_connections() {
    const TASKS: usize = 10;
    const WORKERS: usize = 8;
    const ATTEMPTS: usize = 5;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let path = path.to_str().unwrap();

    let seed_store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(path).unwrap());
    seed_group(seed_store.clone(), "g", TASKS).await;

    let lockers = (0..WORKERS)
        .map(|_| {
            let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(path).unwrap());
            Locker::new(store, Duration::seconds(STALE))
        })
        .collect();
    let claimed = race(lockers, ATTEMPTS).await;

    assert_eq!(claimed.len(), 1, "group g was claimed by several workers: {claimed:?}");
    let held = seed_store
        .find(&TaskFilter::all().in_group("g"))
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.locked_at != UNLOCKED)
        .count();
    assert_eq!(held, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_take_one_task_per_group_in_memory() {
    const WORKERS: usize = 8;

    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    seed_group(store.clone(), "g", 10).await;
    seed_group(store.clone(), "h", 10).await;

    let lockers = (0..WORKERS)
        .map(|_| Locker::new(store.clone(), Duration::seconds(STALE)))
        .collect();
    let claimed = race(lockers, 5).await;

    assert_no_duplicates(&claimed);
    let mut groups: Vec<_> = claimed.iter().map(|id| &id[..1]).collect();
    groups.sort();
    assert_eq!(groups, ["g", "h"]);
}

#[tokio::test]
async fn claims_follow_start_at_order() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    let now = store.now().await.unwrap();
    let scheduler = Scheduler::new(store.clone());

    for (id, ago) in [("late", 10), ("early", 30), ("middle", 20)] {
        scheduler
            .schedule(
                "job",
                json!(null),
                TaskOptions::new()
                    .with_task_id(id)
                    .start_at(now - Duration::seconds(ago)),
            )
            .await
            .unwrap();
    }

    let locker = Locker::new(store, Duration::seconds(STALE));
    let mut order = Vec::new();
    while let Some(task) = locker.claim_next("w").await.unwrap() {
        assert_eq!(task.locked_at, now);
        order.push(task.task_id);
    }
    assert_eq!(order, ["early", "middle", "late"]);
}

#[tokio::test]
async fn future_tasks_wait_for_their_start() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    let now = store.now().await.unwrap();
    Scheduler::new(store.clone())
        .schedule(
            "job",
            json!(null),
            TaskOptions::new().start_at(now + Duration::seconds(60)),
        )
        .await
        .unwrap();

    let locker = Locker::new(store, Duration::seconds(STALE));
    assert!(locker.claim_next("w").await.unwrap().is_none());
    mem.advance_clock(Duration::seconds(60));
    assert!(locker.claim_next("w").await.unwrap().is_some());
}

#[tokio::test]
async fn stale_lock_is_reclaimed() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    seed(store.clone(), 1).await;
    let locker = Locker::new(store, Duration::seconds(STALE));

    let first = locker.claim_next("crashed").await.unwrap().unwrap();
    assert!(locker.claim_next("other").await.unwrap().is_none());

    // exactly at the threshold the lock is still live
    mem.advance_clock(Duration::seconds(STALE));
    assert!(locker.claim_next("other").await.unwrap().is_none());

    mem.advance_clock(Duration::seconds(1));
    let second = locker.claim_next("other").await.unwrap().unwrap();
    assert_eq!(second.task_id, first.task_id);
    assert!(second.locked_at > first.locked_at);
}

#[tokio::test]
async fn release_stale_unlocks_abandoned_claims_only() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    let scheduler = Scheduler::new(store.clone());
    for name in ["abandoned", "live"] {
        scheduler
            .schedule(name, json!(null), TaskOptions::new().with_task_id(name))
            .await
            .unwrap();
    }
    let locker = Locker::new(store.clone(), Duration::seconds(STALE));

    locker
        .claim_next_of("crashed", &["abandoned".to_string()])
        .await
        .unwrap()
        .unwrap();
    mem.advance_clock(Duration::seconds(STALE + 1));
    let live = locker
        .claim_next_of("alive", &["live".to_string()])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(locker.release_stale().await.unwrap(), 1);
    let abandoned = store.find(&TaskFilter::by_id("abandoned")).await.unwrap();
    assert_eq!(abandoned[0].locked_at, UNLOCKED);
    let still_held = store.find(&TaskFilter::by_id("live")).await.unwrap();
    assert_eq!(still_held[0].locked_at, live.locked_at);
}

#[tokio::test]
async fn live_claim_blocks_only_its_own_group() {
    let memory: Arc<dyn TaskStore> = frozen_store();
    let sqlite: Arc<dyn TaskStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    for store in [memory, sqlite] {
        let scheduler = Scheduler::new(store.clone());
        scheduler
            .schedule("first", json!(null), TaskOptions::new().in_group("g"))
            .await
            .unwrap();
        scheduler
            .schedule("second", json!(null), TaskOptions::new().in_group("g"))
            .await
            .unwrap();
        scheduler
            .schedule("other", json!(null), TaskOptions::new().in_group("h"))
            .await
            .unwrap();

        let locker = Locker::new(store.clone(), Duration::seconds(STALE));
        let names = |n: &str| vec![n.to_string()];

        let held = locker.claim_next_of("w1", &names("first")).await.unwrap();
        assert!(held.is_some(), "backend {}", store.backend());
        assert!(
            locker.claim_next_of("w2", &names("second")).await.unwrap().is_none(),
            "group g must stay blocked on {}",
            store.backend()
        );
        assert!(locker.claim_next_of("w3", &names("other")).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn stale_claim_no_longer_blocks_group() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    let scheduler = Scheduler::new(store.clone());
    for name in ["first", "second"] {
        scheduler
            .schedule(name, json!(null), TaskOptions::new().in_group("g"))
            .await
            .unwrap();
    }
    let locker = Locker::new(store.clone(), Duration::seconds(STALE));
    let second = vec!["second".to_string()];

    locker.claim_next_of("w1", &["first".to_string()]).await.unwrap().unwrap();
    assert!(locker.claim_next_of("w2", &second).await.unwrap().is_none());

    mem.advance_clock(Duration::seconds(STALE + 1));
    let claimed = locker.claim_next_of("w2", &second).await.unwrap().unwrap();
    assert_eq!(claimed.name, "second");
}

#[tokio::test]
async fn processed_member_frees_its_group() {
    let mem = frozen_store();
    let store: Arc<dyn TaskStore> = mem.clone();
    let scheduler = Scheduler::new(store.clone());
    // identical timestamps under the frozen clock; ids break the tie
    for (id, name) in [("1", "first"), ("2", "second")] {
        scheduler
            .schedule(
                name,
                json!(null),
                TaskOptions::new().with_task_id(id).in_group("g"),
            )
            .await
            .unwrap();
    }
    let locker = Locker::new(store.clone(), Duration::seconds(STALE));

    let first = locker.claim_next("w").await.unwrap().unwrap();
    assert_eq!(first.name, "first");
    assert!(locker.claim_next("w").await.unwrap().is_none());

    let now = store.now().await.unwrap();
    store
        .update_many(
            &TaskFilter::by_id(first.task_id.as_str()),
            &taskrunner_store::TaskUpdate::new().processed(now),
        )
        .await
        .unwrap();
    assert_eq!(locker.claim_next("w").await.unwrap().unwrap().name, "second");
}
