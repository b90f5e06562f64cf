//! Selective purge and full reset.
//!
//! Every deletion is an independent step. A failed step is recorded in the
//! [`PurgeReport`] and the purge carries on; the page is reloaded whatever
//! the outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::host::PageHost;
use crate::storage::{LocalStore, RESET_DATABASES, RESET_KEYS};
use crate::worker::WorkerPlatform;

/// Delay before the reload that ends a full reset, so the log reaches its sink.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_secs(2);

/// Something a purge removes, or failed to enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    Partition(String),
    Registration(String),
    LocalKey(String),
    Database(String),
    PartitionList,
    RegistrationList,
}

impl fmt::Display for PurgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeTarget::Partition(name) => write!(f, "cache partition {}", name),
            PurgeTarget::Registration(scope) => write!(f, "worker registration {}", scope),
            PurgeTarget::LocalKey(key) => write!(f, "local entry {}", key),
            PurgeTarget::Database(name) => write!(f, "local database {}", name),
            PurgeTarget::PartitionList => f.write_str("cache partition list"),
            PurgeTarget::RegistrationList => f.write_str("worker registration list"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to remove {target}: {reason}")]
pub struct PurgeStepFailed {
    pub target: PurgeTarget,
    pub reason: String,
}

/// Outcome of a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: Vec<PurgeTarget>,
    pub failures: Vec<PurgeStepFailed>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn removed_partitions(&self) -> Vec<&str> {
        self.removed
            .iter()
            .filter_map(|t| match t {
                PurgeTarget::Partition(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn fail(&mut self, target: PurgeTarget, reason: impl fmt::Display) {
        let step = PurgeStepFailed {
            target,
            reason: reason.to_string(),
        };
        warn!(error = %step, "Purge step failed");
        self.failures.push(step);
    }
}

pub struct PurgeService {
    store: CacheStore,
    platform: Arc<dyn WorkerPlatform>,
    local: Arc<dyn LocalStore>,
    host: Arc<dyn PageHost>,
    reload_delay: Duration,
}

impl PurgeService {
    pub fn new(
        store: CacheStore,
        platform: Arc<dyn WorkerPlatform>,
        local: Arc<dyn LocalStore>,
        host: Arc<dyn PageHost>,
    ) -> Self {
        Self {
            store,
            platform,
            local,
            host,
            reload_delay: DEFAULT_RELOAD_DELAY,
        }
    }

    pub fn with_reload_delay(mut self, delay: Duration) -> Self {
        self.reload_delay = delay;
        self
    }

    /// Delete every cache partition and worker registration, then reload.
    ///
    /// Local state (login flag, preferences) is left alone.
    pub async fn force_app_update(&self) -> PurgeReport {
        info!("Forcing application update");
        let mut report = PurgeReport::default();
        self.purge_partitions(&mut report, |_| true).await;
        self.purge_registrations(&mut report).await;
        info!(
            removed = report.removed.len(),
            failed = report.failures.len(),
            "Application update purge finished, reloading"
        );
        self.host.reload();
        report
    }

    /// Selective purge plus the allow-listed local entries and databases,
    /// then reload after the flush delay.
    pub async fn nuke_all_caches(&self) -> PurgeReport {
        info!("Resetting all local application state");
        let mut report = PurgeReport::default();
        self.purge_partitions(&mut report, |_| true).await;
        self.purge_registrations(&mut report).await;

        for key in RESET_KEYS {
            match self.local.remove(key).await {
                Ok(true) => report.removed.push(PurgeTarget::LocalKey(key.to_string())),
                Ok(false) => {}
                Err(e) => report.fail(PurgeTarget::LocalKey(key.to_string()), e),
            }
        }
        for name in RESET_DATABASES {
            match self.local.delete_database(name).await {
                Ok(true) => report.removed.push(PurgeTarget::Database(name.to_string())),
                Ok(false) => {}
                Err(e) => report.fail(PurgeTarget::Database(name.to_string()), e),
            }
        }

        for target in &report.removed {
            info!(%target, "Removed");
        }
        info!(
            removed = report.removed.len(),
            failed = report.failures.len(),
            delay_ms = self.reload_delay.as_millis() as u64,
            "Reset finished, reloading"
        );
        tokio::time::sleep(self.reload_delay).await;
        self.host.reload();
        report
    }

    /// Delete partitions whose name contains any of `patterns`. No reload.
    pub async fn clear_caches_by_pattern(&self, patterns: &[&str]) -> PurgeReport {
        let mut report = PurgeReport::default();
        if patterns.is_empty() {
            return report;
        }
        self.purge_partitions(&mut report, |name| patterns.iter().any(|p| name.contains(p)))
            .await;
        for name in report.removed_partitions() {
            info!(partition = %name, "Cleared cache partition");
        }
        report
    }

    async fn purge_partitions(&self, report: &mut PurgeReport, selected: impl Fn(&str) -> bool) {
        let names = match self.store.partition_names().await {
            Ok(names) => names,
            Err(e) => {
                report.fail(PurgeTarget::PartitionList, e);
                return;
            }
        };

        let targets: Vec<String> = names.into_iter().filter(|n| selected(n)).collect();
        let results = join_all(targets.iter().map(|name| self.store.delete_partition(name))).await;
        for (name, result) in targets.into_iter().zip(results) {
            match result {
                // Evicted since enumeration; nothing left to remove.
                Ok(false) => {}
                Ok(true) => report.removed.push(PurgeTarget::Partition(name)),
                Err(e) => report.fail(PurgeTarget::Partition(name), e),
            }
        }
    }

    async fn purge_registrations(&self, report: &mut PurgeReport) {
        let registrations = match self.platform.registrations().await {
            Ok(registrations) => registrations,
            Err(e) => {
                report.fail(PurgeTarget::RegistrationList, e);
                return;
            }
        };

        for info in registrations {
            let target = PurgeTarget::Registration(info.scope.clone());
            let scope = match Url::parse(&info.scope) {
                Ok(scope) => scope,
                Err(e) => {
                    report.fail(target, e);
                    continue;
                }
            };
            match self.platform.unregister(&scope).await {
                Ok(true) => report.removed.push(target),
                Ok(false) => {}
                Err(e) => report.fail(target, e),
            }
        }
    }
}
