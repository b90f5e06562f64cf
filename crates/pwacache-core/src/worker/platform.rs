use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use super::registration::{ClientId, RegistrationInfo, WorkerId, WorkerState};
use crate::error::WorkerError;

/// Notifications from the worker platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    StateChange {
        scope: String,
        worker_id: WorkerId,
        state: WorkerState,
    },
    /// A new worker started installing.
    UpdateFound { scope: String },
    /// Controlled pages switched to a newly activated worker.
    ControllerChange { scope: String, worker_id: WorkerId },
}

/// The hosting platform's worker registry.
///
/// Registrations are platform-owned; every method returns a fresh snapshot
/// and callers must not assume it still holds after the next suspension point.
#[async_trait]
pub trait WorkerPlatform: Send + Sync {
    /// Register `script_url` for `scope`. Registering the same script for the
    /// same scope again returns the existing registration unchanged.
    async fn register(&self, script_url: &Url, scope: &Url) -> Result<RegistrationInfo, WorkerError>;

    async fn registration(&self, scope: &Url) -> Result<Option<RegistrationInfo>, WorkerError>;

    async fn registrations(&self) -> Result<Vec<RegistrationInfo>, WorkerError>;

    /// Re-fetch the worker script out of band and install it if it changed.
    async fn update(&self, scope: &Url) -> Result<RegistrationInfo, WorkerError>;

    /// Ask the waiting worker to activate now. Returns false if none is waiting.
    async fn skip_waiting(&self, scope: &Url) -> Result<bool, WorkerError>;

    /// Returns false if there was no registration for `scope`.
    async fn unregister(&self, scope: &Url) -> Result<bool, WorkerError>;

    /// Mark a page as controlled by the scope's active worker.
    async fn attach_client(&self, scope: &Url) -> Result<ClientId, WorkerError>;

    /// A controlled page closed.
    async fn detach_client(&self, client: ClientId) -> Result<(), WorkerError>;

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent>;
}
