//! Persistence layer — libSQL-backed storage for tasks, runs and agent state.

pub mod codec;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{STALE_RESET_REASON, TaskStore};
