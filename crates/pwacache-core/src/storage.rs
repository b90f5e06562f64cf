//! Persisted local state outside the cache: key-value entries and named
//! local databases.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;

/// Stored credentials flag.
pub const AUTH_KEY: &str = "auth";
pub const THEME_KEY: &str = "theme";
/// Push messaging token.
pub const FCM_TOKEN_KEY: &str = "fcmToken";

/// Keys removed by a full reset. Everything else survives.
pub const RESET_KEYS: [&str; 3] = [AUTH_KEY, THEME_KEY, FCM_TOKEN_KEY];

/// Local databases removed by a full reset. No other database may be deleted.
pub const RESET_DATABASES: [&str; 3] = [
    "firebase-installations-store",
    "firebase-messaging-store",
    "workbox-expiration",
];

const STATE_FILE: &str = "state.json";
const DATABASES_DIR: &str = "databases";

fn check_database(name: &str) -> Result<(), StorageError> {
    if RESET_DATABASES.contains(&name) {
        Ok(())
    } else {
        Err(StorageError::NotAllowed(name.to_string()))
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Returns false if the key was not set.
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    async fn len(&self) -> Result<usize, StorageError>;

    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Delete an allow-listed local database. Returns false if it did not exist.
    async fn delete_database(&self, name: &str) -> Result<bool, StorageError>;
}

/// Local state kept as a JSON map on disk, databases as entries under
/// `databases/`.
pub struct FileLocalStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on the state file.
    lock: tokio::sync::Mutex<()>,
}

impl FileLocalStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.dir.join(DATABASES_DIR).join(name)
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let path = self.state_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &BTreeMap<String, String>) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = serde_json::to_string_pretty(state)?;
        tokio::fs::write(self.state_path(), contents).await?;
        Ok(())
    }
}

async fn remove_path(path: &Path) -> Result<bool, StorageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    Ok(true)
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        state.insert(key.to_string(), value.to_string());
        self.save(&state).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        if state.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&state).await?;
        debug!(key, "Removed local entry");
        Ok(true)
    }

    async fn len(&self) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.len())
    }

    async fn delete_database(&self, name: &str) -> Result<bool, StorageError> {
        check_database(name)?;
        remove_path(&self.database_path(name)).await
    }
}

/// In-process local state.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<BTreeMap<String, String>>,
    databases: Mutex<BTreeSet<String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, name: &str) {
        self.databases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries().remove(key).is_some())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries().len())
    }

    async fn delete_database(&self, name: &str) -> Result<bool, StorageError> {
        check_database(name)?;
        Ok(self
            .databases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name))
    }
}
