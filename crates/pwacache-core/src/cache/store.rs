//! Expiration-enforcing view over a [`CacheBackend`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::entry::{CachedResponse, RequestKey};
use crate::clock::Clock;
use crate::error::CacheError;

/// Per-partition limits, applied on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub max_age_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl Expiration {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Entry for `key` if present and no older than `max_age`.
    ///
    /// Older entries are treated as absent even though they are still stored.
    pub async fn lookup(
        &self,
        partition: &str,
        key: &RequestKey,
        max_age: Duration,
    ) -> Result<Option<CachedResponse>, CacheError> {
        let now = self.clock.now();
        Ok(self
            .backend
            .get(partition, key)
            .await?
            .filter(|entry| {
                let fresh = entry.is_fresh(max_age, now);
                if !fresh {
                    debug!(partition, key = %key, age_secs = entry.age(now).as_secs(), "Cached entry past max age");
                }
                fresh
            }))
    }

    /// Write an entry, then enforce the partition's age and count limits.
    pub async fn store(
        &self,
        partition: &str,
        key: &RequestKey,
        entry: CachedResponse,
        expiration: &Expiration,
    ) -> Result<(), CacheError> {
        self.backend.put(partition, key, entry).await?;
        self.enforce(partition, key, expiration).await
    }

    /// Sweep expired entries and trim to the count limit. `written` is never
    /// evicted, whatever its timestamp.
    async fn enforce(&self, partition: &str, written: &RequestKey, expiration: &Expiration) -> Result<(), CacheError> {
        let now = self.clock.now();
        let max_age = expiration.max_age();
        let mut entries = self.backend.entries(partition).await?;

        let (expired, mut live): (Vec<_>, Vec<_>) = entries.drain(..).partition(|meta| {
            &meta.key != written && (now - meta.cached_at).to_std().unwrap_or(Duration::ZERO) > max_age
        });

        for meta in &expired {
            self.delete_quietly(partition, &meta.key).await;
        }

        if let Some(max_entries) = expiration.max_entries {
            if live.len() > max_entries {
                // Oldest first; key breaks ties so eviction is deterministic.
                live.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.key.cmp(&b.key)));
                let excess = live.len() - max_entries;
                for meta in live.iter().filter(|meta| &meta.key != written).take(excess) {
                    self.delete_quietly(partition, &meta.key).await;
                }
            }
        }

        if !expired.is_empty() {
            debug!(partition, expired = expired.len(), "Expired cache entries removed");
        }
        Ok(())
    }

    async fn delete_quietly(&self, partition: &str, key: &RequestKey) {
        if let Err(e) = self.backend.delete_entry(partition, key).await {
            warn!(partition, key = %key, error = %e, "Failed to evict cache entry");
        }
    }

    pub async fn partition_names(&self) -> Result<Vec<String>, CacheError> {
        self.backend.partition_names().await
    }

    pub async fn entry_count(&self, partition: &str) -> Result<usize, CacheError> {
        Ok(self.backend.entries(partition).await?.len())
    }

    /// Newest entry in a partition, if any.
    pub async fn newest_entry(&self, partition: &str) -> Result<Option<CachedResponse>, CacheError> {
        let newest = self
            .backend
            .entries(partition)
            .await?
            .into_iter()
            .max_by_key(|meta| meta.cached_at);
        match newest {
            Some(meta) => self.backend.get(partition, &meta.key).await,
            None => Ok(None),
        }
    }

    pub async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        self.backend.delete_partition(partition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::clock::ManualClock;
    use crate::network::{ResourceRequest, ResourceResponse};
    use chrono::{Duration as ChronoDuration, Utc};

    fn setup() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = CacheStore::new(Arc::new(MemoryCacheBackend::new()), clock.clone());
        (store, clock)
    }

    async fn write(store: &CacheStore, url: &str, expiration: &Expiration) -> RequestKey {
        let request = ResourceRequest::parse(url).unwrap();
        let response = ResourceResponse::ok(url, url.as_bytes().to_vec());
        let key = RequestKey::from_request(&request);
        let entry = CachedResponse::new(&request, &response, store.clock().now());
        store.store("images-cache", &key, entry, expiration).await.unwrap();
        key
    }

    #[tokio::test]
    async fn test_lookup_hides_entries_past_max_age() {
        let (store, clock) = setup();
        let expiration = Expiration {
            max_age_secs: 60,
            max_entries: None,
        };
        let key = write(&store, "https://example.com/a.png", &expiration).await;

        clock.advance(ChronoDuration::seconds(60));
        assert!(store.lookup("images-cache", &key, expiration.max_age()).await.unwrap().is_some());

        clock.advance(ChronoDuration::seconds(1));
        assert!(store.lookup("images-cache", &key, expiration.max_age()).await.unwrap().is_none());
        // Still physically stored until the next write sweeps it.
        assert_eq!(store.entry_count("images-cache").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_evicts_oldest_beyond_max_entries() {
        let (store, clock) = setup();
        let expiration = Expiration {
            max_age_secs: 3600,
            max_entries: Some(2),
        };
        let first = write(&store, "https://example.com/1.png", &expiration).await;
        clock.advance(ChronoDuration::seconds(1));
        let second = write(&store, "https://example.com/2.png", &expiration).await;
        clock.advance(ChronoDuration::seconds(1));
        let third = write(&store, "https://example.com/3.png", &expiration).await;

        let max_age = expiration.max_age();
        assert!(store.lookup("images-cache", &first, max_age).await.unwrap().is_none());
        assert!(store.lookup("images-cache", &second, max_age).await.unwrap().is_some());
        assert!(store.lookup("images-cache", &third, max_age).await.unwrap().is_some());
        assert_eq!(store.entry_count("images-cache").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_never_evicts_the_entry_just_written() {
        let (store, clock) = setup();
        let expiration = Expiration {
            max_age_secs: 3600,
            max_entries: Some(1),
        };
        let later = write(&store, "https://example.com/b.png", &expiration).await;

        // Clock stepped back: the new entry is older than the one it displaces.
        clock.advance(ChronoDuration::seconds(-30));
        let earlier = write(&store, "https://example.com/a.png", &expiration).await;

        let max_age = expiration.max_age();
        assert!(store.lookup("images-cache", &earlier, max_age).await.unwrap().is_some());
        assert!(store.lookup("images-cache", &later, max_age).await.unwrap().is_none());
        assert_eq!(store.entry_count("images-cache").await.unwrap(), 1);

        // Same timestamp, and the written key sorts first.
        let same = write(&store, "https://example.com/0.png", &expiration).await;
        assert!(store.lookup("images-cache", &same, max_age).await.unwrap().is_some());
        assert_eq!(store.entry_count("images-cache").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_sweeps_expired_entries() {
        let (store, clock) = setup();
        let expiration = Expiration {
            max_age_secs: 60,
            max_entries: None,
        };
        write(&store, "https://example.com/old.png", &expiration).await;
        clock.advance(ChronoDuration::seconds(120));
        write(&store, "https://example.com/new.png", &expiration).await;

        assert_eq!(store.entry_count("images-cache").await.unwrap(), 1);
        let newest = store.newest_entry("images-cache").await.unwrap().unwrap();
        assert_eq!(newest.url, "https://example.com/new.png");
    }
}
