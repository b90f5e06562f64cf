//! In-process worker platform.
//!
//! Fetches worker scripts through the [`Network`], fingerprints them, and
//! drives each [`Registration`] through install → waiting → active the way
//! a browser would: a new worker parks in the waiting slot while an older
//! one still controls pages, and takes over on skip-waiting or once the
//! last controlled page closes.
//!
//! Registrations outlive a session when the runtime is opened on a state
//! file. Controlled pages do not, so a worker left waiting by the previous
//! session is activated on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::platform::{WorkerEvent, WorkerPlatform};
use super::registration::{ClientId, Registration, RegistrationInfo, Worker, WorkerId, WorkerState};
use crate::clock::Clock;
use crate::error::WorkerError;
use crate::network::{Destination, Network, ResourceRequest};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct LocalWorkerRuntime {
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    registrations: RwLock<HashMap<String, Registration>>,
    /// Controlled pages and the scope controlling them.
    clients: RwLock<HashMap<ClientId, String>>,
    events: broadcast::Sender<WorkerEvent>,
    /// Registrations are saved here after every change, if set.
    state_file: Option<PathBuf>,
}

type Registrations = HashMap<String, Registration>;

impl LocalWorkerRuntime {
    /// A runtime whose registrations live only as long as it does.
    pub fn new(network: Arc<dyn Network>, clock: Arc<dyn Clock>) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            network,
            clock,
            registrations: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            events,
            state_file: None,
        }
    }

    /// A runtime that restores registrations from `state_file` and saves
    /// them back on every change. A missing file means no registrations.
    pub fn open(network: Arc<dyn Network>, clock: Arc<dyn Clock>, state_file: PathBuf) -> Result<Self, WorkerError> {
        let restored = Self::load(&state_file, clock.now())?;
        if !restored.is_empty() {
            debug!(count = restored.len(), path = %state_file.display(), "Restored worker registrations");
        }
        let mut runtime = Self::new(network, clock);
        runtime.registrations = RwLock::new(restored);
        runtime.state_file = Some(state_file);
        Ok(runtime)
    }

    fn load(path: &Path, now: chrono::DateTime<chrono::Utc>) -> Result<Registrations, WorkerError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(WorkerError::Platform(format!("{}: {}", path.display(), e))),
        };
        let saved: Vec<Registration> = match serde_json::from_str(&contents) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable worker registrations");
                return Ok(HashMap::new());
            }
        };
        Ok(saved
            .into_iter()
            .map(|mut registration| {
                for worker in registration.workers() {
                    WorkerId::observe(worker.id);
                }
                // An install cannot span sessions.
                registration.installing = None;
                if registration.waiting.is_some() {
                    debug!(scope = %registration.scope, "Activating worker left waiting by the last session");
                    registration.activate(now);
                }
                (registration.scope.to_string(), registration)
            })
            .collect())
    }

    /// Write the registrations to the state file, if any.
    async fn save(&self, registrations: &Registrations) -> Result<(), WorkerError> {
        let Some(path) = self.state_file.as_ref() else {
            return Ok(());
        };
        let mut saved: Vec<&Registration> = registrations.values().collect();
        saved.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        let contents = serde_json::to_string_pretty(&saved)
            .map_err(|e| WorkerError::Platform(format!("failed to encode registrations: {}", e)))?;

        let io_err = |e: std::io::Error| WorkerError::Platform(format!("{}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)
    }

    fn emit(&self, events: Vec<WorkerEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Fetch a worker script and return its fingerprint.
    async fn fetch_script(&self, script_url: &Url) -> Result<String, WorkerError> {
        let request = ResourceRequest::get(script_url.clone()).with_destination(Destination::Worker);
        let response = self
            .network
            .fetch(&request)
            .await
            .map_err(|e| WorkerError::RegistrationFailed(format!("{}: {}", script_url, e)))?;

        if !response.is_success() {
            return Err(WorkerError::RegistrationFailed(format!(
                "{}: status {}",
                script_url, response.status
            )));
        }
        let source = std::str::from_utf8(&response.body)
            .map_err(|_| WorkerError::ScriptError(format!("{} is not valid UTF-8", script_url)))?;
        if source.trim().is_empty() {
            return Err(WorkerError::ScriptError(format!("{} is empty", script_url)));
        }
        Ok(hex::encode(Sha256::digest(source.as_bytes())))
    }

    fn same_origin(a: &Url, b: &Url) -> bool {
        a.origin() == b.origin()
    }

    async fn controlled_clients(&self, scope: &str) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|s| s.as_str() == scope)
            .count()
    }

    /// Install `worker` into `registration`, activating it straight away when
    /// no page is held by an older worker.
    fn install(
        &self,
        registration: &mut Registration,
        worker: Worker,
        controlled_clients: usize,
        events: &mut Vec<WorkerEvent>,
    ) {
        let now = self.clock.now();
        let scope = registration.scope.to_string();
        let id = worker.id;

        events.push(WorkerEvent::UpdateFound {
            scope: scope.clone(),
        });
        if let Some(old) = registration.begin_install(worker, now) {
            events.push(Self::state_event(&scope, &old));
        }
        events.push(WorkerEvent::StateChange {
            scope: scope.clone(),
            worker_id: id,
            state: WorkerState::Installing,
        });

        if let Some(displaced) = registration.install_complete(now) {
            events.push(Self::state_event(&scope, &displaced));
        }
        events.push(WorkerEvent::StateChange {
            scope: scope.clone(),
            worker_id: id,
            state: WorkerState::Installed,
        });

        if registration.active.is_none() || controlled_clients == 0 {
            self.activate(registration, controlled_clients, events);
        } else {
            info!(scope = %scope, worker = %id, "New worker installed and waiting");
        }
    }

    fn activate(&self, registration: &mut Registration, controlled_clients: usize, events: &mut Vec<WorkerEvent>) {
        let now = self.clock.now();
        let scope = registration.scope.to_string();
        if registration.waiting.is_none() {
            return;
        }
        let retired = registration.activate(now);
        if let Some(old) = retired {
            events.push(Self::state_event(&scope, &old));
        }
        if let Some(active) = registration.active.as_ref() {
            events.push(WorkerEvent::StateChange {
                scope: scope.clone(),
                worker_id: active.id,
                state: WorkerState::Activated,
            });
            if controlled_clients > 0 {
                events.push(WorkerEvent::ControllerChange {
                    scope: scope.clone(),
                    worker_id: active.id,
                });
            }
            info!(scope = %scope, worker = %active.id, "Worker activated");
        }
    }

    fn state_event(scope: &str, worker: &Worker) -> WorkerEvent {
        WorkerEvent::StateChange {
            scope: scope.to_string(),
            worker_id: worker.id,
            state: worker.state,
        }
    }
}

#[async_trait]
impl WorkerPlatform for LocalWorkerRuntime {
    async fn register(&self, script_url: &Url, scope: &Url) -> Result<RegistrationInfo, WorkerError> {
        if !Self::same_origin(script_url, scope) {
            return Err(WorkerError::SecurityError(format!(
                "script {} is not same-origin with scope {}",
                script_url, scope
            )));
        }

        let key = scope.to_string();
        if let Some(existing) = self.registrations.read().await.get(&key) {
            if existing.newest().map(|w| &w.script_url) == Some(script_url) {
                debug!(scope = %key, "Worker already registered");
                return Ok(existing.info());
            }
        }

        let hash = self.fetch_script(script_url).await?;
        let clients = self.controlled_clients(&key).await;
        let mut events = Vec::new();
        let info = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(key.clone())
                .or_insert_with(|| Registration::new(scope.clone()));
            // A concurrent register may have installed the same script meanwhile.
            let unchanged = registration
                .newest()
                .map(|w| &w.script_url == script_url && w.script_hash == hash)
                .unwrap_or(false);
            if !unchanged {
                let worker = Worker::new(script_url.clone(), hash, self.clock.now());
                self.install(registration, worker, clients, &mut events);
            }
            registration.last_update_check = Some(self.clock.now());
            let info = registration.info();
            self.save(&registrations).await?;
            info
        };
        self.emit(events);
        Ok(info)
    }

    async fn registration(&self, scope: &Url) -> Result<Option<RegistrationInfo>, WorkerError> {
        Ok(self
            .registrations
            .read()
            .await
            .get(scope.as_str())
            .map(Registration::info))
    }

    async fn registrations(&self) -> Result<Vec<RegistrationInfo>, WorkerError> {
        let mut infos: Vec<RegistrationInfo> = self
            .registrations
            .read()
            .await
            .values()
            .map(Registration::info)
            .collect();
        infos.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(infos)
    }

    async fn update(&self, scope: &Url) -> Result<RegistrationInfo, WorkerError> {
        let key = scope.to_string();
        let script_url = self
            .registrations
            .read()
            .await
            .get(&key)
            .and_then(|r| r.newest().map(|w| w.script_url.clone()))
            .ok_or_else(|| WorkerError::NotFound(key.clone()))?;

        let hash = self.fetch_script(&script_url).await?;
        let clients = self.controlled_clients(&key).await;
        let mut events = Vec::new();
        let info = {
            let mut registrations = self.registrations.write().await;
            // Unregistered while the script was in flight.
            let registration = registrations
                .get_mut(&key)
                .ok_or_else(|| WorkerError::NotFound(key.clone()))?;
            registration.last_update_check = Some(self.clock.now());

            let changed = registration
                .newest()
                .map(|w| w.script_hash != hash)
                .unwrap_or(true);
            if changed {
                let worker = Worker::new(script_url, hash, self.clock.now());
                self.install(registration, worker, clients, &mut events);
            } else {
                debug!(scope = %key, "Worker script unchanged");
            }
            let info = registration.info();
            self.save(&registrations).await?;
            info
        };
        self.emit(events);
        Ok(info)
    }

    async fn skip_waiting(&self, scope: &Url) -> Result<bool, WorkerError> {
        let key = scope.to_string();
        let clients = self.controlled_clients(&key).await;
        let mut events = Vec::new();
        let adopted = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&key)
                .ok_or_else(|| WorkerError::NotFound(key.clone()))?;
            if registration.waiting.is_none() {
                false
            } else {
                self.activate(registration, clients, &mut events);
                self.save(&registrations).await?;
                true
            }
        };
        self.emit(events);
        Ok(adopted)
    }

    async fn unregister(&self, scope: &Url) -> Result<bool, WorkerError> {
        let key = scope.to_string();
        let mut registrations = self.registrations.write().await;
        let removed = registrations.remove(&key);
        match removed {
            Some(mut registration) => {
                self.save(&registrations).await?;
                drop(registrations);
                let now = self.clock.now();
                let events = registration
                    .unregister(now)
                    .iter()
                    .map(|worker| Self::state_event(&key, worker))
                    .collect();
                self.clients.write().await.retain(|_, s| s != &key);
                self.emit(events);
                info!(scope = %key, "Worker registration removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_client(&self, scope: &Url) -> Result<ClientId, WorkerError> {
        let key = scope.to_string();
        let controlled = self
            .registrations
            .read()
            .await
            .get(&key)
            .map(|r| r.active.is_some())
            .ok_or_else(|| WorkerError::NotFound(key.clone()))?;
        if !controlled {
            return Err(WorkerError::Platform(format!("no active worker for {}", key)));
        }
        let id = ClientId::next();
        self.clients.write().await.insert(id, key);
        Ok(id)
    }

    async fn detach_client(&self, client: ClientId) -> Result<(), WorkerError> {
        let mut clients = self.clients.write().await;
        let Some(scope) = clients.remove(&client) else {
            return Ok(());
        };
        let remaining = clients.values().filter(|s| **s == scope).count();
        drop(clients);

        if remaining == 0 {
            let mut events = Vec::new();
            let mut registrations = self.registrations.write().await;
            if let Some(registration) = registrations.get_mut(&scope) {
                if registration.waiting.is_some() {
                    debug!(scope = %scope, "Last controlled page closed, activating waiting worker");
                    self.activate(registration, 0, &mut events);
                    self.save(&registrations).await?;
                }
            }
            drop(registrations);
            self.emit(events);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::test_support::{Reply, ScriptedNetwork};

    const SCRIPT: &str = "https://example.com/proformas_system/firebase-messaging-sw.js";
    const SCOPE: &str = "https://example.com/proformas_system/";

    fn runtime() -> (LocalWorkerRuntime, Arc<ScriptedNetwork>) {
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));
        (LocalWorkerRuntime::new(network.clone(), Arc::new(SystemClock)), network)
    }

    fn urls() -> (Url, Url) {
        (Url::parse(SCRIPT).unwrap(), Url::parse(SCOPE).unwrap())
    }

    #[tokio::test]
    async fn test_first_registration_activates_immediately() {
        let (rt, _) = runtime();
        let (script, scope) = urls();

        let info = rt.register(&script, &scope).await.unwrap();
        assert!(info.active.is_some());
        assert!(info.waiting.is_none());
        assert_eq!(info.active.unwrap().state, WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (rt, network) = runtime();
        let (script, scope) = urls();

        let first = rt.register(&script, &scope).await.unwrap();
        let second = rt.register(&script, &scope).await.unwrap();
        assert_eq!(first.active, second.active);
        assert_eq!(rt.registrations().await.unwrap().len(), 1);
        assert_eq!(network.calls(SCRIPT), 1);
    }

    #[tokio::test]
    async fn test_register_failures() {
        let (rt, network) = runtime();
        let (script, scope) = urls();

        network.set(SCRIPT, Reply::Fail);
        assert!(matches!(
            rt.register(&script, &scope).await,
            Err(WorkerError::RegistrationFailed(_))
        ));

        network.set(SCRIPT, Reply::ok("   "));
        assert!(matches!(
            rt.register(&script, &scope).await,
            Err(WorkerError::ScriptError(_))
        ));

        let foreign = Url::parse("https://cdn.example.net/sw.js").unwrap();
        assert!(matches!(
            rt.register(&foreign, &scope).await,
            Err(WorkerError::SecurityError(_))
        ));
        assert!(rt.registrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_with_unchanged_script_installs_nothing() {
        let (rt, _) = runtime();
        let (script, scope) = urls();
        let before = rt.register(&script, &scope).await.unwrap();

        let after = rt.update(&scope).await.unwrap();
        assert_eq!(before.active, after.active);
        assert!(after.waiting.is_none());
        assert!(after.last_update_check.is_some());
    }

    #[tokio::test]
    async fn test_update_waits_while_page_is_controlled() {
        let (rt, network) = runtime();
        let (script, scope) = urls();
        rt.register(&script, &scope).await.unwrap();
        rt.attach_client(&scope).await.unwrap();

        network.set(SCRIPT, Reply::ok("self.version = 2;"));
        let info = rt.update(&scope).await.unwrap();
        assert!(info.has_waiting());
        assert_eq!(info.waiting.unwrap().state, WorkerState::Installed);
    }

    #[tokio::test]
    async fn test_update_without_pages_activates_at_once() {
        let (rt, network) = runtime();
        let (script, scope) = urls();
        let first = rt.register(&script, &scope).await.unwrap().active.unwrap();

        network.set(SCRIPT, Reply::ok("self.version = 2;"));
        let info = rt.update(&scope).await.unwrap();
        assert!(!info.has_waiting());
        assert_ne!(info.active.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_skip_waiting_swaps_controller() {
        let (rt, network) = runtime();
        let (script, scope) = urls();
        let old = rt.register(&script, &scope).await.unwrap().active.unwrap();
        rt.attach_client(&scope).await.unwrap();
        network.set(SCRIPT, Reply::ok("self.version = 2;"));
        let waiting = rt.update(&scope).await.unwrap().waiting.unwrap();

        let mut events = rt.subscribe();
        assert!(rt.skip_waiting(&scope).await.unwrap());

        let info = rt.registration(&scope).await.unwrap().unwrap();
        assert_eq!(info.active.unwrap().id, waiting.id);
        assert!(info.waiting.is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&WorkerEvent::StateChange {
            scope: SCOPE.to_string(),
            worker_id: old.id,
            state: WorkerState::Redundant,
        }));
        assert!(seen.contains(&WorkerEvent::ControllerChange {
            scope: SCOPE.to_string(),
            worker_id: waiting.id,
        }));

        assert!(!rt.skip_waiting(&scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_closing_last_page_activates_waiting_worker() {
        let (rt, network) = runtime();
        let (script, scope) = urls();
        rt.register(&script, &scope).await.unwrap();
        let client = rt.attach_client(&scope).await.unwrap();
        network.set(SCRIPT, Reply::ok("self.version = 2;"));
        let waiting = rt.update(&scope).await.unwrap().waiting.unwrap();

        rt.detach_client(client).await.unwrap();

        let info = rt.registration(&scope).await.unwrap().unwrap();
        assert_eq!(info.active.as_ref().unwrap().id, waiting.id);
        assert!(!info.has_waiting());
    }

    #[tokio::test]
    async fn test_unregister() {
        let (rt, _) = runtime();
        let (script, scope) = urls();
        rt.register(&script, &scope).await.unwrap();

        assert!(rt.unregister(&scope).await.unwrap());
        assert!(!rt.unregister(&scope).await.unwrap());
        assert!(rt.registration(&scope).await.unwrap().is_none());
        assert!(matches!(rt.update(&scope).await, Err(WorkerError::NotFound(_))));
    }

    fn reopen(network: &Arc<ScriptedNetwork>, path: &Path) -> LocalWorkerRuntime {
        LocalWorkerRuntime::open(network.clone(), Arc::new(SystemClock), path.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_registrations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));
        let (script, scope) = urls();

        let first = {
            let rt = reopen(&network, &path);
            rt.register(&script, &scope).await.unwrap().active.unwrap()
        };

        let rt = reopen(&network, &path);
        let infos = rt.registrations().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].active.as_ref().unwrap().id, first.id);

        // Same script again: nothing refetched, nothing reinstalled.
        let info = rt.register(&script, &scope).await.unwrap();
        assert_eq!(info.active.unwrap().id, first.id);
        assert_eq!(network.calls(SCRIPT), 1);
    }

    #[tokio::test]
    async fn test_waiting_worker_takes_over_in_next_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));
        let (script, scope) = urls();

        let waiting = {
            let rt = reopen(&network, &path);
            rt.register(&script, &scope).await.unwrap();
            rt.attach_client(&scope).await.unwrap();
            network.set(SCRIPT, Reply::ok("self.version = 2;"));
            rt.update(&scope).await.unwrap().waiting.unwrap()
        };

        let rt = reopen(&network, &path);
        let info = rt.registration(&scope).await.unwrap().unwrap();
        assert_eq!(info.active.as_ref().unwrap().id, waiting.id);
        assert!(!info.has_waiting());

        // Fresh ids never collide with restored ones.
        network.set(SCRIPT, Reply::ok("self.version = 3;"));
        let newer = rt.update(&scope).await.unwrap().active.unwrap();
        assert!(newer.id > waiting.id);
    }

    #[tokio::test]
    async fn test_unregister_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let network = Arc::new(ScriptedNetwork::new());
        network.set(SCRIPT, Reply::ok("self.version = 1;"));
        let (script, scope) = urls();

        {
            let rt = reopen(&network, &path);
            rt.register(&script, &scope).await.unwrap();
            assert!(rt.unregister(&scope).await.unwrap());
        }

        assert!(reopen(&network, &path).registrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let network = Arc::new(ScriptedNetwork::new());

        let rt = reopen(&network, &path);
        assert!(rt.registrations().await.unwrap().is_empty());
    }
}
