//! `taskrunner-store`: the durable store behind the task scheduler.
//!
//! # Overview
//!
//! [`TaskStore`] is the document-store contract the engine relies on:
//! insert with a unique `taskId`, atomic find-and-modify, bulk update,
//! find and remove by [`TaskFilter`]. Workers never coordinate in memory;
//! every claim is a single conditional write against the store.
//!
//! # Backends
//!
//! | Backend         | Use                                                |
//! |-----------------|----------------------------------------------------|
//! | [`SqliteStore`] | Durable; many processes may share one file          |
//! | [`MemoryStore`] | Process-local; controllable clock for tests         |

pub mod db;
pub mod error;
pub mod filter;
pub mod group;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod update;

pub use error::{Result, StoreError};
pub use filter::{ClaimWindow, TaskFilter};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{connect, TaskStore};
pub use update::{Field, RetriesUpdate, TaskUpdate};
