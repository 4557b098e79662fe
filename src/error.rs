//! Error taxonomy shared by the server and client cores.

use crate::meta::MetaError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the synchronization core.
///
/// Storage operations never panic across the API boundary; they return one
/// of these. The stream session translates them into wire-level ERROR
/// messages and keeps the session alive.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The version-increase arbiter rejected the request outright.
    #[error("request denied")]
    Denied,

    /// The file is locked by another client; retry on the next snapshot.
    #[error("file blocked")]
    Blocked,

    #[error("timed out: {0}")]
    Timeout(String),

    /// The stream was shut down while an operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    #[error("not connected to server")]
    NotConnected,

    #[error("metadata store: {0}")]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }
}
