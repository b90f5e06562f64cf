//! Read-only dump of cache, worker and local storage state.

use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::LocalStore;
use crate::strategy::FetchEngine;
use crate::worker::{LifecycleState, WorkerPlatform, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct PartitionSummary {
    pub name: String,
    pub entries: usize,
    /// Age of the most recently written entry, e.g. "5m ago".
    pub newest: Option<String>,
    /// Whether a resource class currently writes here.
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct RegistrationSummary {
    pub scope: String,
    pub state: LifecycleState,
    pub active_worker: Option<WorkerState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct DiagnosticReport {
    pub app_version: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub generated_at: DateTime<Utc>,
    pub online: bool,
    pub network_only: bool,
    pub partitions: Vec<PartitionSummary>,
    pub registrations: Vec<RegistrationSummary>,
    /// None when local storage could not be read.
    pub local_entries: Option<usize>,
}

/// Collect the current state. Sources that fail to answer are left out of
/// the report.
pub async fn snapshot(
    engine: &FetchEngine,
    platform: &dyn WorkerPlatform,
    local: &dyn LocalStore,
) -> DiagnosticReport {
    let store = engine.store();
    let now = store.clock().now();

    let names = store.partition_names().await.unwrap_or_else(|e| {
        debug!(error = %e, "Failed to list cache partitions for diagnostics");
        Vec::new()
    });
    let partitions = join_all(names.into_iter().map(|name| async move {
        let entries = store.entry_count(&name).await.unwrap_or_else(|e| {
            debug!(partition = %name, error = %e, "Failed to count cache entries");
            0
        });
        let newest = match store.newest_entry(&name).await {
            Ok(entry) => entry.map(|e| e.age_display(now)),
            Err(e) => {
                debug!(partition = %name, error = %e, "Failed to read newest cache entry");
                None
            }
        };
        PartitionSummary {
            owned: engine.policies().owns_partition(&name),
            name,
            entries,
            newest,
        }
    }))
    .await;

    let registrations = platform
        .registrations()
        .await
        .unwrap_or_else(|e| {
            debug!(error = %e, "Failed to list worker registrations for diagnostics");
            Vec::new()
        })
        .into_iter()
        .map(|info| RegistrationSummary {
            state: info.lifecycle_state(),
            active_worker: info.active.as_ref().map(|w| w.state),
            scope: info.scope,
        })
        .collect();

    let local_entries = match local.len().await {
        Ok(n) => Some(n),
        Err(e) => {
            debug!(error = %e, "Failed to read local storage for diagnostics");
            None
        }
    };

    DiagnosticReport {
        app_version: crate::APP_VERSION.to_string(),
        generated_at: now,
        online: engine.connectivity().is_online(),
        network_only: engine.is_network_only(),
        partitions,
        registrations,
        local_entries,
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pwacache {} ({})", self.app_version, self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(
            f,
            "Connectivity: {}{}",
            if self.online { "online" } else { "offline" },
            if self.network_only { ", network only" } else { "" }
        )?;

        writeln!(f, "Cache partitions ({}):", self.partitions.len())?;
        for p in &self.partitions {
            writeln!(
                f,
                "  {:<20} {:>4} entries  newest {}{}",
                p.name,
                p.entries,
                p.newest.as_deref().unwrap_or("never"),
                if p.owned { "" } else { "  (outdated)" }
            )?;
        }

        writeln!(f, "Worker registrations ({}):", self.registrations.len())?;
        for r in &self.registrations {
            match r.active_worker {
                Some(state) => writeln!(f, "  {}  {} (active worker {})", r.scope, r.state, state)?,
                None => writeln!(f, "  {}  {}", r.scope, r.state)?,
            }
        }

        match self.local_entries {
            Some(n) => write!(f, "Local storage: {} entries", n),
            None => write!(f, "Local storage: unavailable"),
        }
    }
}
