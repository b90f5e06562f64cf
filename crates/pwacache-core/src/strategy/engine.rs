use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::classify::classify;
use super::policy::{ClassPolicy, Strategy, StrategyTable};
use crate::cache::{CacheStore, CachedResponse, RequestKey};
use crate::connectivity::Connectivity;
use crate::error::FetchError;
use crate::network::{Network, NetworkError, ResourceRequest, ResourceResponse};

/// Serves classified requests from the cache, the network, or both.
///
/// Clone is cheap; clones share the same store, network and mode.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: CacheStore,
    network: Arc<dyn Network>,
    policies: StrategyTable,
    connectivity: Connectivity,
    /// Set when no worker could be registered: no cache reads or writes.
    network_only: AtomicBool,
}

impl EngineInner {
    /// Fetch from the network and, on a 2xx response, write the class partition.
    async fn fetch_and_store(
        &self,
        request: &ResourceRequest,
        key: &RequestKey,
        policy: &ClassPolicy,
    ) -> Result<ResourceResponse, NetworkError> {
        let response = self.network.fetch(request).await?;
        if !response.is_success() {
            return Err(NetworkError::Status {
                status: response.status,
                body: String::new(),
            });
        }

        let entry = CachedResponse::new(request, &response, self.store.clock().now());
        if let Err(e) = self
            .store
            .store(&policy.partition, key, entry, &policy.expiration)
            .await
        {
            warn!(partition = %policy.partition, key = %key, error = %e, "Failed to cache network response");
        }
        Ok(response)
    }

    async fn cached(&self, policy: &ClassPolicy, key: &RequestKey) -> Option<ResourceResponse> {
        match self.store.lookup(&policy.partition, key, policy.max_age()).await {
            Ok(entry) => entry.map(CachedResponse::into_response),
            Err(e) => {
                debug!(partition = %policy.partition, key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }
}

impl FetchEngine {
    pub fn new(
        store: CacheStore,
        network: Arc<dyn Network>,
        policies: StrategyTable,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                network,
                policies,
                connectivity,
                network_only: AtomicBool::new(false),
            }),
        }
    }

    pub fn policies(&self) -> &StrategyTable {
        &self.inner.policies
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Switch between cached strategies and plain network access.
    pub fn set_network_only(&self, enabled: bool) {
        let previous = self.inner.network_only.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            if enabled {
                warn!("Offline support unavailable, serving requests from network only");
            } else {
                info!("Offline support enabled");
            }
        }
    }

    pub fn is_network_only(&self) -> bool {
        self.inner.network_only.load(Ordering::SeqCst)
    }

    /// Satisfy a request according to its class policy.
    pub async fn fetch(&self, request: ResourceRequest) -> Result<ResourceResponse, FetchError> {
        let class = classify(&request);
        let policy = self.inner.policies.policy(class).clone();
        let key = RequestKey::from_request(&request);
        debug!(url = %request.url, %class, partition = %policy.partition, "Fetching resource");

        if self.is_network_only() {
            return self.network_only(&request).await;
        }

        if !self.inner.connectivity.is_online() {
            // No network attempt while offline; it could only time out.
            return self
                .inner
                .cached(&policy, &key)
                .await
                .ok_or_else(|| FetchError::unavailable(request.url.as_str()));
        }

        match policy.strategy {
            Strategy::CacheFirst => self.cache_first(request, key, policy).await,
            Strategy::NetworkFirst {
                network_timeout_secs,
            } => {
                self.network_first(request, key, policy, Duration::from_secs(network_timeout_secs))
                    .await
            }
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, key, policy).await,
        }
    }

    async fn network_only(&self, request: &ResourceRequest) -> Result<ResourceResponse, FetchError> {
        match self.inner.network.fetch(request).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "Network-only fetch returned error status");
                Err(FetchError::unavailable(request.url.as_str()))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network-only fetch failed");
                Err(FetchError::unavailable(request.url.as_str()))
            }
        }
    }

    async fn cache_first(
        &self,
        request: ResourceRequest,
        key: RequestKey,
        policy: ClassPolicy,
    ) -> Result<ResourceResponse, FetchError> {
        if let Some(cached) = self.inner.cached(&policy, &key).await {
            return Ok(cached);
        }
        self.inner
            .fetch_and_store(&request, &key, &policy)
            .await
            .map_err(|e| {
                debug!(url = %request.url, error = %e, "Cache miss and network failed");
                FetchError::unavailable(request.url.as_str())
            })
    }

    async fn network_first(
        &self,
        request: ResourceRequest,
        key: RequestKey,
        policy: ClassPolicy,
        timeout: Duration,
    ) -> Result<ResourceResponse, FetchError> {
        let url = request.url.to_string();
        // The timeout cancels our wait, not the request: a late response
        // still lands in the cache.
        let update = self.spawn_update(request, key.clone(), policy.clone());

        match tokio::time::timeout(timeout, update).await {
            Ok(Ok(Ok(response))) => return Ok(response),
            Ok(Ok(Err(e))) => {
                debug!(url = %url, error = %e, "Network fetch failed, falling back to cache");
            }
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Network task aborted, falling back to cache");
            }
            Err(_) => {
                debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "Network timed out, falling back to cache");
            }
        }

        self.inner
            .cached(&policy, &key)
            .await
            .ok_or_else(|| FetchError::unavailable(url))
    }

    async fn stale_while_revalidate(
        &self,
        request: ResourceRequest,
        key: RequestKey,
        policy: ClassPolicy,
    ) -> Result<ResourceResponse, FetchError> {
        let cached = self.inner.cached(&policy, &key).await;
        let url = request.url.to_string();
        let update = self.spawn_update(request, key, policy);

        if let Some(cached) = cached {
            // Revalidation continues in the background for next time.
            drop(update);
            return Ok(cached);
        }

        match update.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Nothing cached and network failed");
                Err(FetchError::unavailable(url))
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Network task aborted");
                Err(FetchError::unavailable(url))
            }
        }
    }

    fn spawn_update(
        &self,
        request: ResourceRequest,
        key: RequestKey,
        policy: ClassPolicy,
    ) -> JoinHandle<Result<ResourceResponse, NetworkError>> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.fetch_and_store(&request, &key, &policy).await })
    }
}
