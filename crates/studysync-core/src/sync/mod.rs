//! Offline-first synchronization: queue drain, metadata diff, realtime ingest,
//! and the background engine that schedules them.

mod backoff;
mod cancel;
mod coordinator;
mod engine;
mod ingestor;
mod policy;
mod registry;
mod resource;


pub use backoff::RetryPolicy;
pub use cancel::{CancelHandle, CancelSignal};
pub use coordinator::{
    DiffReport, EventOutcome, SyncContext, SyncCoordinator, SyncPhase, SyncReport,
};
pub use engine::SyncEngine;
pub use ingestor::RealtimeIngestor;
pub use policy::{ConflictPolicy, PoisonPolicy, SyncPolicy};
pub use registry::{ResourceKind, SyncRegistry, SyncRegistryBuilder, SyncSummary};
pub use resource::{MultipleDocuments, Record, SingleDocument};
