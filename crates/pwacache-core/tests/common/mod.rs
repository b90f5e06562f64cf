#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pwacache_core::cache::MemoryCacheBackend;
use pwacache_core::clock::Clock;
use pwacache_core::config::Config;
use pwacache_core::host::ChannelPageHost;
use pwacache_core::network::{Network, NetworkError, ResourceRequest, ResourceResponse};
use pwacache_core::storage::MemoryLocalStore;
use pwacache_core::{LocalWorkerRuntime, OfflineApp, Platform, SystemClock, UpdateNotice};
use tokio::sync::mpsc;

pub const ORIGIN: &str = "https://example.com";
pub const SCRIPT: &str = "https://example.com/proformas_system/firebase-messaging-sw.js";
pub const INDEX: &str = "https://example.com/proformas_system/";
pub const PROFORMAS: &str = "https://example.com/proformas_system/data/proformas.json";

/// A site whose files can be changed or taken offline between requests.
#[derive(Default)]
pub struct MockSite {
    files: Mutex<HashMap<String, String>>,
    down: Mutex<bool>,
}

impl MockSite {
    pub fn new() -> Arc<Self> {
        let site = Arc::new(Self::default());
        site.publish(SCRIPT, "self.version = 1;");
        site.publish(INDEX, "<!doctype html><title>Proformas</title>");
        site
    }

    pub fn publish(&self, url: &str, body: &str) {
        self.files.lock().unwrap().insert(url.to_string(), body.to_string());
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }
}

#[async_trait]
impl Network for MockSite {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceResponse, NetworkError> {
        if *self.down.lock().unwrap() {
            return Err(NetworkError::Unreachable(request.url.to_string()));
        }
        match self.files.lock().unwrap().get(request.url.as_str()) {
            Some(body) => Ok(ResourceResponse::ok(request.url.as_str(), body.as_bytes().to_vec())),
            None => {
                let mut missing = ResourceResponse::ok(request.url.as_str(), Vec::new());
                missing.status = 404;
                Ok(missing)
            }
        }
    }
}

pub struct TestApp {
    pub app: OfflineApp,
    pub notices: mpsc::Receiver<UpdateNotice>,
    pub reloads: mpsc::UnboundedReceiver<()>,
    pub local: Arc<MemoryLocalStore>,
    pub workers: Arc<LocalWorkerRuntime>,
}

pub fn test_app(site: Arc<MockSite>) -> TestApp {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (host, reloads) = ChannelPageHost::new();
    let local = Arc::new(MemoryLocalStore::new());
    let workers = Arc::new(LocalWorkerRuntime::new(site.clone(), clock.clone()));
    let platform = Platform {
        cache: Arc::new(MemoryCacheBackend::new()),
        workers: workers.clone(),
        network: site,
        local: local.clone(),
        host: Arc::new(host),
        clock,
    };
    let config = Config {
        origin: ORIGIN.to_string(),
        ..Config::default()
    };
    let (app, notices) = OfflineApp::new(config, platform).unwrap();
    TestApp {
        app,
        notices,
        reloads,
        local,
        workers,
    }
}

/// Let spawned tasks run until `done` holds.
pub async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
}
