//! Application configuration management.
//!
//! Configuration is stored at `~/.config/pwacache/config.json`. Missing
//! fields take their defaults, and `PWACACHE_ORIGIN` / `PWACACHE_BASE_PATH`
//! override the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::strategy::StrategyTable;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "pwacache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ORIGIN_ENV: &str = "PWACACHE_ORIGIN";
const BASE_PATH_ENV: &str = "PWACACHE_BASE_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheme, host and port the app is served from.
    pub origin: String,
    /// Path prefix of the app; also the worker scope.
    pub base_path: String,
    /// Worker script, relative to the base path.
    pub worker_script: String,
    pub poll_interval_secs: u64,
    /// Delay between a full reset and the reload that follows it.
    pub reload_delay_ms: u64,
    pub policies: StrategyTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:4173".to_string(),
            base_path: "/proformas_system/".to_string(),
            worker_script: "firebase-messaging-sw.js".to_string(),
            poll_interval_secs: 30,
            reload_delay_ms: 2000,
            policies: StrategyTable::default(),
        }
    }
}

impl Config {
    /// Load from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.policies.validate().context("Invalid cache policy table")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = var(ORIGIN_ENV).filter(|v| !v.is_empty()) {
            self.origin = origin;
        }
        if let Some(base_path) = var(BASE_PATH_ENV).filter(|v| !v.is_empty()) {
            self.base_path = base_path;
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Where cache partitions live on disk.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Where local key-value state and local databases live.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Origin plus base path, always ending in a slash.
    pub fn base_url(&self) -> Result<Url> {
        let mut path = self.base_path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        let origin = Url::parse(&self.origin).with_context(|| format!("Invalid origin: {}", self.origin))?;
        origin
            .join(&path)
            .with_context(|| format!("Invalid base path: {}", self.base_path))
    }

    /// Worker scope; same as the base URL.
    pub fn scope_url(&self) -> Result<Url> {
        self.base_url()
    }

    pub fn script_url(&self) -> Result<Url> {
        self.base_url()?
            .join(&self.worker_script)
            .with_context(|| format!("Invalid worker script: {}", self.worker_script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_urls() {
        let config = Config::default();
        assert_eq!(config.base_url().unwrap().as_str(), "http://localhost:4173/proformas_system/");
        assert_eq!(
            config.script_url().unwrap().as_str(),
            "http://localhost:4173/proformas_system/firebase-messaging-sw.js"
        );
        assert_eq!(config.scope_url().unwrap(), config.base_url().unwrap());
    }

    #[test]
    fn test_base_path_is_normalized() {
        let config = Config {
            base_path: "app".to_string(),
            ..Config::default()
        };
        assert_eq!(config.base_url().unwrap().path(), "/app/");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"origin":"https://example.com"}"#).unwrap();
        assert_eq!(config.origin, "https://example.com");
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.policies, StrategyTable::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            ORIGIN_ENV => Some("https://example.com".to_string()),
            BASE_PATH_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.origin, "https://example.com");
        assert_eq!(config.base_path, "/proformas_system/");
    }

    #[test]
    fn test_invalid_origin_is_an_error() {
        let config = Config {
            origin: "not a url".to_string(),
            ..Config::default()
        };
        assert!(config.base_url().is_err());
    }
}
