use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::entry::{CachedResponse, RequestKey};
use crate::error::CacheError;

/// Key and insertion time of a stored entry, used for eviction ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: RequestKey,
    pub cached_at: DateTime<Utc>,
}

/// Platform cache storage, partitioned by name.
///
/// Writing to a partition that does not exist creates it. Every call may
/// observe a partition that was evicted since the previous call.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn partition_names(&self) -> Result<Vec<String>, CacheError>;

    async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError>;

    async fn put(&self, partition: &str, key: &RequestKey, entry: CachedResponse) -> Result<(), CacheError>;

    async fn delete_entry(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError>;

    async fn entries(&self, partition: &str) -> Result<Vec<EntryMeta>, CacheError>;

    /// Returns false if the partition did not exist.
    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError>;
}

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    partitions: RwLock<HashMap<String, HashMap<RequestKey, CachedResponse>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn partition_names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.partitions.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, partition: &str, key: &RequestKey, entry: CachedResponse) -> Result<(), CacheError> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_default()
            .insert(key.clone(), entry);
        Ok(())
    }

    async fn delete_entry(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError> {
        Ok(self
            .partitions
            .write()
            .await
            .get_mut(partition)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn entries(&self, partition: &str) -> Result<Vec<EntryMeta>, CacheError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, entry)| EntryMeta {
                        key: key.clone(),
                        cached_at: entry.cached_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        Ok(self.partitions.write().await.remove(partition).is_some())
    }
}
