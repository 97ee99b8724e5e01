//! `taskrunner-core`: shared types, configuration and errors.
//!
//! The [`types::TaskRecord`] defined here is the only entity the store
//! persists; every other crate in the workspace reads and writes it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{StoreConfig, TaskRunnerConfig, WorkerConfig};
pub use error::{CoreError, Result};
pub use types::{TaskOptions, TaskRecord, UNLOCKED};
