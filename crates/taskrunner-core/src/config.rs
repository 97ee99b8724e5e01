use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STALE_LOCK_SECS: u64 = 300; // a claim older than 5 min is presumed abandoned
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Top-level config (taskrunner.toml + TASKRUNNER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunnerConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store location: `sqlite://<path>`, `sqlite::memory:` or `memory://`.
    #[serde(default = "default_store_uri")]
    pub uri: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
        }
    }
}

/// Settings for the claim/execute poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker identifier used in logs. Generated when absent.
    pub id: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age after which a claim is treated as abandoned and reclaimable.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
    /// Upper bound on a single handler run. Unbounded when absent.
    pub execution_timeout_secs: Option<u64>,
    /// Number of independent poll loops a process runs.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
            execution_timeout_secs: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl WorkerConfig {
    /// The configured worker id, or a fresh `worker-<uuid>` one.
    pub fn worker_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()))
    }

    pub fn poll_interval(&self) -> Duration {
        // tokio's interval panics on a zero period
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_lock_threshold(&self) -> chrono::Duration {
        i64::try_from(self.stale_lock_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_stale_lock_secs() -> u64 {
    DEFAULT_STALE_LOCK_SECS
}
fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_store_uri() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("sqlite://{}/.taskrunner/tasks.db", home)
}

impl TaskRunnerConfig {
    /// Load config from a TOML file with TASKRUNNER_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `TASKRUNNER_WORKER__STALE_LOCK_SECS=60`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TaskRunnerConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKRUNNER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskrunner/taskrunner.toml", home)
}
