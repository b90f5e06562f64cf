//! Wires the components together and exposes the boot hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheBackend, CacheStore, DiskCacheBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::data::DataService;
use crate::diagnostics::{self, DiagnosticReport};
use crate::host::{PageHost, UpdateNotice};
use crate::network::{HttpNetwork, Network};
use crate::poller::UpdatePoller;
use crate::purge::PurgeService;
use crate::storage::{FileLocalStore, LocalStore};
use crate::strategy::FetchEngine;
use crate::worker::{LifecycleController, LocalWorkerRuntime, WorkerPlatform};

/// Update notices waiting for the UI.
const NOTICE_BUFFER_SIZE: usize = 8;

/// Worker registrations, under the data directory.
const WORKERS_FILE: &str = "workers.json";

/// Platform capabilities the app runs against.
#[derive(Clone)]
pub struct Platform {
    pub cache: Arc<dyn CacheBackend>,
    pub workers: Arc<dyn WorkerPlatform>,
    pub network: Arc<dyn Network>,
    pub local: Arc<dyn LocalStore>,
    pub host: Arc<dyn PageHost>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    /// Disk-backed cache, local state and worker registrations over an HTTP
    /// network.
    pub fn native(config: &Config, host: Arc<dyn PageHost>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let network: Arc<dyn Network> = Arc::new(HttpNetwork::new().context("Failed to build HTTP client")?);
        let cache = DiskCacheBackend::new(config.cache_dir()?).context("Failed to open cache directory")?;
        let data_dir = config.data_dir()?;
        let workers = LocalWorkerRuntime::open(network.clone(), clock.clone(), data_dir.join(WORKERS_FILE))
            .context("Failed to load worker registrations")?;
        Ok(Self {
            cache: Arc::new(cache),
            workers: Arc::new(workers),
            local: Arc::new(FileLocalStore::new(data_dir)),
            network,
            host,
            clock,
        })
    }
}

/// One page session of the offline-capable app.
pub struct OfflineApp {
    config: Config,
    engine: FetchEngine,
    controller: Arc<LifecycleController>,
    poller: Arc<UpdatePoller>,
    purge: PurgeService,
    data: DataService,
    workers: Arc<dyn WorkerPlatform>,
    local: Arc<dyn LocalStore>,
    connectivity: Connectivity,
    booted: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineApp {
    /// Build the app. Update notices arrive on the returned receiver.
    pub fn new(config: Config, platform: Platform) -> Result<(Self, mpsc::Receiver<UpdateNotice>)> {
        config.policies.validate().context("Invalid cache policy table")?;
        let base_url = config.base_url()?;
        let script_url = config.script_url()?;

        let connectivity = Connectivity::default();
        let store = CacheStore::new(platform.cache.clone(), platform.clock.clone());
        let engine = FetchEngine::new(
            store.clone(),
            platform.network.clone(),
            config.policies.clone(),
            connectivity.clone(),
        );
        let controller = Arc::new(LifecycleController::new(
            platform.workers.clone(),
            engine.clone(),
            platform.host.clone(),
            script_url,
            config.scope_url()?,
        ));

        let (tx, rx) = mpsc::channel(NOTICE_BUFFER_SIZE);
        let poller = Arc::new(UpdatePoller::new(
            controller.clone(),
            connectivity.clone(),
            Duration::from_secs(config.poll_interval_secs),
            tx,
        ));
        let purge = PurgeService::new(
            store,
            platform.workers.clone(),
            platform.local.clone(),
            platform.host.clone(),
        )
        .with_reload_delay(Duration::from_millis(config.reload_delay_ms));
        let data = DataService::new(engine.clone(), base_url);

        let app = Self {
            config,
            engine,
            controller,
            poller,
            purge,
            data,
            workers: platform.workers,
            local: platform.local,
            connectivity,
            booted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        Ok((app, rx))
    }

    /// Register the worker and arm the update poller in the background.
    ///
    /// Returns immediately. Only the first call has any effect.
    pub fn boot(&self) {
        if self.booted.swap(true, Ordering::SeqCst) {
            debug!("Already booted");
            return;
        }
        info!(scope = %self.controller.scope(), "Booting offline support");

        // Subscribed before registering so no controller change is missed.
        let events = self.controller.spawn_event_loop(self.shutdown.clone());

        let controller = self.controller.clone();
        let registration = tokio::spawn(async move {
            if let Err(e) = controller.register().await {
                warn!(error = %e, "Continuing without offline support");
            }
        });

        let poller = self.poller.clone().spawn(self.shutdown.clone());

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.extend([events, registration, poller]);
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &FetchEngine {
        &self.engine
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn poller(&self) -> &Arc<UpdatePoller> {
        &self.poller
    }

    pub fn purge(&self) -> &PurgeService {
        &self.purge
    }

    pub fn data(&self) -> &DataService {
        &self.data
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub async fn diagnostics(&self) -> DiagnosticReport {
        diagnostics::snapshot(&self.engine, self.workers.as_ref(), self.local.as_ref()).await
    }

    /// Stop background tasks and detach this page from its worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }
        self.controller.release().await;
        debug!("Offline app shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::storage::MemoryLocalStore;
    use crate::test_support::{settle, CountingHost, Reply, ScriptedNetwork};
    use crate::worker::LifecycleState;

    const SCRIPT: &str = "https://example.com/proformas_system/firebase-messaging-sw.js";

    fn app(network: Arc<ScriptedNetwork>) -> (OfflineApp, mpsc::Receiver<UpdateNotice>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let platform = Platform {
            cache: Arc::new(MemoryCacheBackend::new()),
            workers: Arc::new(LocalWorkerRuntime::new(network.clone(), clock.clone())),
            network,
            local: Arc::new(MemoryLocalStore::new()),
            host: Arc::new(CountingHost::default()),
            clock,
        };
        let config = Config {
            origin: "https://example.com".to_string(),
            ..Config::default()
        };
        OfflineApp::new(config, platform).unwrap()
    }

    #[tokio::test]
    async fn test_boot_twice_registers_once() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));
        let (app, _notices) = app(network.clone());

        app.boot();
        app.boot();
        let net = network.clone();
        settle(|| net.calls(SCRIPT) > 0).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(network.calls(SCRIPT), 1);
        assert_eq!(app.diagnostics().await.registrations.len(), 1);
        assert_eq!(app.controller().state().await.unwrap(), LifecycleState::Active);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_app_usable() {
        let network = Arc::new(ScriptedNetwork::new());
        let (app, _notices) = app(network.clone());

        app.boot();
        let engine = app.engine().clone();
        settle(|| engine.is_network_only()).await;

        assert!(app.engine().is_network_only());
        assert!(app.data().pedidos().await.is_empty());
        app.shutdown().await;
    }

    fn session(network: Arc<ScriptedNetwork>, workers_file: &std::path::Path) -> OfflineApp {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let workers = LocalWorkerRuntime::open(network.clone(), clock.clone(), workers_file.to_path_buf()).unwrap();
        let platform = Platform {
            cache: Arc::new(MemoryCacheBackend::new()),
            workers: Arc::new(workers),
            network,
            local: Arc::new(MemoryLocalStore::new()),
            host: Arc::new(CountingHost::default()),
            clock,
        };
        let config = Config {
            origin: "https://example.com".to_string(),
            reload_delay_ms: 0,
            ..Config::default()
        };
        OfflineApp::new(config, platform).unwrap().0
    }

    #[tokio::test]
    async fn test_registration_is_visible_to_later_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let workers_file = dir.path().join(WORKERS_FILE);
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));

        let first = session(network.clone(), &workers_file);
        first.boot();
        let net = network.clone();
        settle(|| net.calls(SCRIPT) > 0).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(first.controller().state().await.unwrap(), LifecycleState::Active);
        first.shutdown().await;

        // A status or purge run never boots, yet sees and removes the worker.
        let second = session(network.clone(), &workers_file);
        assert_eq!(second.diagnostics().await.registrations.len(), 1);
        let report = second.purge().force_app_update().await;
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 1);

        let third = session(network, &workers_file);
        assert!(third.diagnostics().await.registrations.is_empty());
    }

    #[test]
    fn test_invalid_policies_are_rejected() {
        let network = Arc::new(ScriptedNetwork::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let platform = Platform {
            cache: Arc::new(MemoryCacheBackend::new()),
            workers: Arc::new(LocalWorkerRuntime::new(network.clone(), clock.clone())),
            network,
            local: Arc::new(MemoryLocalStore::new()),
            host: Arc::new(CountingHost::default()),
            clock,
        };
        let mut config = Config::default();
        config.policies.image.partition = config.policies.document.partition.clone();
        assert!(OfflineApp::new(config, platform).is_err());
    }
}
