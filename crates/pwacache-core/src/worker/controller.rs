use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::platform::{WorkerEvent, WorkerPlatform};
use super::registration::{ClientId, LifecycleState, RegistrationInfo};
use crate::error::{UpdateCheckFailed, WorkerError};
use crate::host::PageHost;
use crate::strategy::FetchEngine;

/// Drives the worker registration for one scope on behalf of the page.
///
/// Holds no copy of the registration: every query goes back to the platform.
pub struct LifecycleController {
    platform: Arc<dyn WorkerPlatform>,
    engine: FetchEngine,
    host: Arc<dyn PageHost>,
    script_url: Url,
    scope: Url,
    registering: AtomicBool,
    /// This page, once an active worker controls it.
    client: Mutex<Option<ClientId>>,
    /// Set by the first reload of this session.
    reloading: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        platform: Arc<dyn WorkerPlatform>,
        engine: FetchEngine,
        host: Arc<dyn PageHost>,
        script_url: Url,
        scope: Url,
    ) -> Self {
        Self {
            platform,
            engine,
            host,
            script_url,
            scope,
            registering: AtomicBool::new(false),
            client: Mutex::new(None),
            reloading: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn platform(&self) -> &Arc<dyn WorkerPlatform> {
        &self.platform
    }

    /// Register the worker script for this scope.
    ///
    /// On failure the engine drops to network-only mode; the page keeps
    /// working without offline support.
    pub async fn register(&self) -> Result<RegistrationInfo, WorkerError> {
        self.registering.store(true, Ordering::SeqCst);
        let result = self.platform.register(&self.script_url, &self.scope).await;
        self.registering.store(false, Ordering::SeqCst);

        match result {
            Ok(info) => {
                info!(scope = %self.scope, state = %info.lifecycle_state(), "Worker registered");
                self.engine.set_network_only(false);
                self.claim().await;
                Ok(info)
            }
            Err(e) => {
                warn!(scope = %self.scope, script = %self.script_url, error = %e, "Worker registration failed");
                self.engine.set_network_only(true);
                Err(match e {
                    WorkerError::RegistrationFailed(_) => e,
                    other => WorkerError::RegistrationFailed(other.to_string()),
                })
            }
        }
    }

    /// Become a controlled page of the active worker, once.
    async fn claim(&self) {
        let mut client = self.client.lock().await;
        if client.is_some() {
            return;
        }
        match self.platform.attach_client(&self.scope).await {
            Ok(id) => *client = Some(id),
            Err(e) => debug!(scope = %self.scope, error = %e, "Page not controlled yet"),
        }
    }

    /// Re-fetch the worker script and report whether a newer worker is waiting.
    ///
    /// Touches no cached content.
    pub async fn check_for_update(&self) -> Result<bool, UpdateCheckFailed> {
        if self.platform.registration(&self.scope).await?.is_none() {
            return Ok(false);
        }
        self.platform.update(&self.scope).await?;
        // Another update may have landed while ours was in flight.
        let waiting = self
            .platform
            .registration(&self.scope)
            .await?
            .map(|info| info.has_waiting())
            .unwrap_or(false);
        debug!(scope = %self.scope, waiting, "Update check complete");
        Ok(waiting)
    }

    /// Tell the waiting worker to take over. No-op when none is waiting.
    pub async fn request_adoption(&self) -> Result<bool, WorkerError> {
        let adopted = match self.platform.skip_waiting(&self.scope).await {
            Ok(adopted) => adopted,
            Err(WorkerError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if adopted {
            info!(scope = %self.scope, "Waiting worker adopted");
        } else {
            debug!(scope = %self.scope, "No waiting worker to adopt");
        }
        Ok(adopted)
    }

    pub async fn state(&self) -> Result<LifecycleState, WorkerError> {
        if self.registering.load(Ordering::SeqCst) {
            return Ok(LifecycleState::Registering);
        }
        Ok(self
            .platform
            .registration(&self.scope)
            .await?
            .map(|info| info.lifecycle_state())
            .unwrap_or(LifecycleState::Unregistered))
    }

    /// Reload the page unless this session already did.
    pub fn reload_once(&self) {
        if self.reloading.swap(true, Ordering::SeqCst) {
            debug!("Reload already requested");
            return;
        }
        self.host.reload();
    }

    /// Delete partitions no resource class writes to any more.
    pub async fn cleanup_outdated_partitions(&self) -> Vec<String> {
        let store = self.engine.store();
        let names = match store.partition_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not list cache partitions for cleanup");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for name in names {
            if self.engine.policies().owns_partition(&name) {
                continue;
            }
            match store.delete_partition(&name).await {
                Ok(_) => {
                    info!(partition = %name, "Removed outdated cache partition");
                    removed.push(name);
                }
                Err(e) => warn!(partition = %name, error = %e, "Failed to remove outdated cache partition"),
            }
        }
        removed
    }

    /// Detach this page from its worker.
    pub async fn release(&self) {
        if let Some(id) = self.client.lock().await.take() {
            if let Err(e) = self.platform.detach_client(id).await {
                debug!(error = %e, "Failed to detach page from worker");
            }
        }
    }

    /// Watch for this scope's controller changes until `shutdown` fires.
    ///
    /// A controller change cleans up outdated partitions and reloads the page
    /// once.
    pub fn spawn_event_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let mut events = self.platform.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(WorkerEvent::ControllerChange { scope, worker_id }) if scope == controller.scope.as_str() => {
                        info!(scope = %scope, worker = %worker_id, "Controller changed");
                        controller.cleanup_outdated_partitions().await;
                        controller.reload_once();
                    }
                    Ok(WorkerEvent::StateChange { scope, worker_id, state }) => {
                        debug!(scope = %scope, worker = %worker_id, %state, "Worker state changed");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Worker event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
