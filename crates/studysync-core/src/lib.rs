//! studysync-core - offline-first sync engine for study data
//!
//! Local writes land in a libSQL replica and a durable change queue. Per
//! source, a coordinator drains the queue to the remote backend, diffs
//! metadata watermarks to converge, and applies realtime events.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;

pub use config::{BackendConfig, EngineConfig};
pub use error::{Error, Result};
pub use models::{Document, DocumentQuery, MetadataModel, OfflineChange, SourceSyncKey};
pub use services::DatabaseService;
pub use state::{StatusBoard, SyncState};
pub use sync::{SyncContext, SyncCoordinator, SyncEngine, SyncRegistry, SyncReport};
