//! Data models for studysync

mod change;
mod document;
mod organization;
mod realtime;
mod settings;
mod sync_conflict;

pub use change::{ChangeId, ChangeOperation, OfflineChange, ParkedChange, SourceSyncKey};
pub use document::{parse_filter, Document, DocumentQuery, FieldFilter, MetadataModel};
pub use organization::Organization;
pub use realtime::{RealtimeEvent, RealtimeOperation};
pub use settings::{Settings, ThemeMode};
pub use sync_conflict::{ConflictStrategy, SyncConflict};
