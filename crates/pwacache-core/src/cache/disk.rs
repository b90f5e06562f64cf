//! File-backed cache storage.
//!
//! Layout: `<root>/<partition>/<sha256(key)>.json`, each file holding the
//! request key and the cached response. A missing directory is an empty
//! partition.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::backend::{CacheBackend, EntryMeta};
use super::entry::{CachedResponse, RequestKey};
use crate::error::CacheError;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    response: CachedResponse,
}

pub struct DiskCacheBackend {
    root: PathBuf,
    /// Suffix for temp files, unique per write.
    writes: AtomicU64,
}

impl DiskCacheBackend {
    pub fn new(root: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            writes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition names become directory names, so only a safe subset is accepted.
    fn partition_dir(&self, partition: &str) -> Result<PathBuf, CacheError> {
        let valid = !partition.is_empty()
            && !partition.starts_with('.')
            && partition
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CacheError::InvalidPartition(partition.to_string()));
        }
        Ok(self.root.join(partition))
    }

    fn entry_path(&self, partition: &str, key: &RequestKey) -> Result<PathBuf, CacheError> {
        let digest = Sha256::digest(key.as_str().as_bytes());
        Ok(self
            .partition_dir(partition)?
            .join(format!("{}.json", hex::encode(digest))))
    }

    async fn read_entry(path: &Path) -> Result<Option<StoredEntry>, CacheError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheBackend for DiskCacheBackend {
    async fn partition_names(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_dir() {
                if let Some(name) = item.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError> {
        let path = self.entry_path(partition, key)?;
        Ok(Self::read_entry(&path)
            .await?
            .filter(|stored| &stored.key == key)
            .map(|stored| stored.response))
    }

    async fn put(&self, partition: &str, key: &RequestKey, entry: CachedResponse) -> Result<(), CacheError> {
        let path = self.entry_path(partition, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let stored = StoredEntry {
            key: key.clone(),
            response: entry,
        };
        let contents = serde_json::to_vec(&stored)?;
        // Readers must never observe a partially written entry. Concurrent
        // writers to one key each rename their own file; the last rename wins.
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.{}.tmp", std::process::id(), n));
        fs::write(&tmp, contents).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_entry(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError> {
        let path = self.entry_path(partition, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn entries(&self, partition: &str) -> Result<Vec<EntryMeta>, CacheError> {
        let dir_path = self.partition_dir(partition)?;
        let mut metas = Vec::new();
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(stored)) => metas.push(EntryMeta {
                    key: stored.key,
                    cached_at: stored.response.cached_at,
                }),
                Ok(None) => {}
                Err(e) => {
                    // Unreadable entries are dropped.
                    debug!(partition, path = %path.display(), error = %e, "Removing unreadable cache entry");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
        Ok(metas)
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        let dir_path = self.partition_dir(partition)?;
        match fs::remove_dir_all(&dir_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
