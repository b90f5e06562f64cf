//! Test doubles for platform capabilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{CacheStore, CachedResponse, MemoryCacheBackend, RequestKey};
use crate::clock::{Clock, SystemClock};
use crate::connectivity::Connectivity;
use crate::host::PageHost;
use crate::network::{Network, NetworkError, ResourceRequest, ResourceResponse, ResponseSource};
use crate::strategy::{FetchEngine, StrategyTable};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(Vec<u8>),
    Status(u16),
    Fail,
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub(crate) fn ok(body: &str) -> Self {
        Reply::Ok(body.as_bytes().to_vec())
    }

    pub(crate) fn delayed(after: Duration, reply: Reply) -> Self {
        Reply::Delayed(after, Box::new(reply))
    }
}

/// Network answering each URL with a configurable reply; unknown URLs fail.
#[derive(Debug, Default)]
pub(crate) struct ScriptedNetwork {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    pub(crate) fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceResponse, NetworkError> {
        let url = request.url.to_string();
        *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;
        let mut reply = self
            .replies
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or(Reply::Fail);

        loop {
            match reply {
                Reply::Ok(body) => return Ok(ResourceResponse::ok(url, body)),
                Reply::Status(status) => {
                    return Ok(ResourceResponse {
                        url,
                        status,
                        headers: Default::default(),
                        body: Vec::new(),
                        source: ResponseSource::Network,
                    })
                }
                Reply::Fail => return Err(NetworkError::Unreachable(url)),
                Reply::Delayed(after, next) => {
                    tokio::time::sleep(after).await;
                    reply = *next;
                }
            }
        }
    }
}

/// Page host counting reloads.
#[derive(Debug, Default)]
pub(crate) struct CountingHost {
    reloads: AtomicUsize,
}

impl CountingHost {
    pub(crate) fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl PageHost for CountingHost {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Engine over an in-memory cache with the default policy table.
pub(crate) fn memory_engine(network: Arc<dyn Network>) -> FetchEngine {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = CacheStore::new(Arc::new(MemoryCacheBackend::new()), clock);
    FetchEngine::new(store, network, StrategyTable::default(), Connectivity::default())
}

/// Write an entry straight to the backend, bypassing expiration.
pub(crate) async fn seed(store: &CacheStore, partition: &str, url: &str) {
    let request = ResourceRequest::parse(url).unwrap();
    let key = RequestKey::from_request(&request);
    let entry = CachedResponse::new(&request, &ResourceResponse::ok(url, "seed"), store.clock().now());
    store.backend().put(partition, &key, entry).await.unwrap();
}

/// Yield to spawned tasks until `done` holds.
pub(crate) async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Log output captured by [`capture_logs`].
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Capture plain-text logs from the current thread until the guard drops.
pub(crate) fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .without_time()
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
