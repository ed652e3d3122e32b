//! Database layer for studysync

mod change_queue;
mod conflict_log;
mod connection;
mod document_store;
mod migrations;

pub use change_queue::{ChangeQueue, LibSqlChangeQueue};
pub use conflict_log::{ConflictLog, LibSqlConflictLog};
pub use connection::Database;
pub use document_store::{LibSqlLocalStore, LocalChange, LocalStore};
