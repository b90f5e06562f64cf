//! Error types shared across the subsystem.
//!
//! Cache-layer failures never reach the end user as hard errors. The only
//! error a UI caller sees is [`FetchError::ResourceUnavailable`], which it
//! renders as "no data".

use thiserror::Error;

/// Errors raised by a [`CacheBackend`](crate::cache::CacheBackend).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid partition name: {0}")]
    InvalidPartition(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Errors returned by the fetch strategy engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Neither the cache nor the network could satisfy the request.
    #[error("Resource unavailable: {url}")]
    ResourceUnavailable { url: String },
}

impl FetchError {
    pub fn unavailable(url: impl Into<String>) -> Self {
        FetchError::ResourceUnavailable { url: url.into() }
    }
}

/// Errors raised by the worker platform and lifecycle controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Worker script fetch or parse failed at registration time.
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("No registration for scope: {0}")]
    NotFound(String),

    #[error("Worker platform error: {0}")]
    Platform(String),
}

/// A poller tick could not query the platform.
///
/// Treated as "no update" and retried on the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Update check failed: {0}")]
pub struct UpdateCheckFailed(pub String);

impl From<WorkerError> for UpdateCheckFailed {
    fn from(err: WorkerError) -> Self {
        UpdateCheckFailed(err.to_string())
    }
}

/// Errors raised by a [`LocalStore`](crate::storage::LocalStore).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Local storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local storage is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Name is not on the local storage allow-list: {0}")]
    NotAllowed(String),
}
