use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] studysync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Document JSON must be an object: {0}")]
    InvalidDocument(String),
    #[error("Document ID cannot be empty")]
    EmptyDocumentId,
    #[error("Source '{0}' holds a single document; omit the ID")]
    SingleDocumentId(String),
    #[error("Document '{id}' not found in '{source_key}'")]
    DocumentNotFound { source_key: String, id: String },
    #[error("Invalid change id '{0}'")]
    InvalidChangeId(String),
    #[error("Refusing to purge every document; pass at least one --where filter")]
    UnfilteredPurge,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Sync failed for {0} source(s)")]
    SyncFailed(usize),
    #[error(
        "Sync is not configured. Run `studysync config init --api-url <URL> --api-key <KEY>`, or set STUDYSYNC_API_URL and STUDYSYNC_API_KEY."
    )]
    SyncNotConfigured,
}
