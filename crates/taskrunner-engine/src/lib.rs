//! `taskrunner-engine`: scheduling, claiming and execution of persisted tasks.
//!
//! # Lifecycle
//!
//! ```text
//! schedule ──▶ pending ──claim──▶ locked ──handler ok──▶ processed
//!                 ▲                  │  └─handler ok, recurring─┐
//!                 │                  └─handler err (retries+1)──┤
//!                 └─────────────── lock stale / reset ◀─────────┘
//! ```
//!
//! [`Scheduler`] inserts records, [`Locker`] claims them atomically,
//! [`Executor`] runs the registered [`TaskHandler`] and records the
//! outcome, and [`Worker`] ties claiming and execution into a poll loop.
//! [`TaskRunner`] bundles the pieces for embedding applications.

pub mod error;
pub mod executor;
pub mod handler;
pub mod locker;
pub mod repeater;
pub mod runner;
pub mod scheduler;
pub mod worker;

pub use error::{Result, TaskError};
pub use executor::{Executor, RunOutcome};
pub use handler::{FnHandler, HandlerRegistry, TaskHandler};
pub use locker::Locker;
pub use runner::TaskRunner;
pub use scheduler::Scheduler;
pub use worker::Worker;
