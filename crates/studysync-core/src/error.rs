//! Error types for studysync-core

use thiserror::Error;

/// Result type alias using studysync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in studysync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network failure worth retrying (timeouts, 5xx, rate limits, dropped sockets)
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The backend refused the operation for the current credentials
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The backend rejected the document itself
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The backend holds a newer version of the document
    #[error("Conflict detected: {0}")]
    Conflict(String),

    /// HTTP client error that could not be classified further
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Realtime channel error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Sync cycle was cancelled (shutdown, logout)
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::WebSocket(_) => true,
            Self::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.is_request()
                    || error.is_body()
                    || error.is_decode()
                    || error.status().is_some_and(|status| {
                        status.is_server_error() || status.as_u16() == 429
                    })
            }
            _ => false,
        }
    }

    /// Whether the local replica itself failed. These abort the whole sync cycle.
    pub const fn is_local_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::LibSql(_) | Self::Io(_))
    }

    /// Whether the backend refused a single document for good.
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Permission(_) | Self::Validation(_))
    }
}
