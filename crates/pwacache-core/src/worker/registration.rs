//! Worker registration state machine.
//!
//! ```text
//! Registration (scope)
//!     ├── installing (Worker)
//!     ├── waiting    (Worker, installed but not controlling)
//!     └── active     (Worker, controlling pages)
//! ```
//!
//! At most one worker occupies each slot. Promoting a worker out of a slot
//! marks whatever it displaces as redundant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct WorkerId(u64);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

impl WorkerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Keep fresh ids above one restored from saved state.
    pub(crate) fn observe(id: WorkerId) {
        NEXT_WORKER_ID.fetch_max(id.0 + 1, Ordering::Relaxed);
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A page controlled by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// State of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum WorkerState {
    Installing,
    /// Installed and parked until adopted.
    Installed,
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, unregistered, or failed to install.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// State of a registration as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum LifecycleState {
    Unregistered,
    Registering,
    Installing,
    /// A newer worker is installed and waiting for adoption.
    Waiting,
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unregistered => "unregistered",
            LifecycleState::Registering => "registering",
            LifecycleState::Installing => "installing",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Active => "active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub script_url: Url,
    /// Hex SHA-256 of the script body; equal hashes mean "no update".
    pub script_hash: String,
    pub state: WorkerState,
    pub state_changed_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(script_url: Url, script_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkerId::next(),
            script_url,
            script_hash,
            state: WorkerState::Installing,
            state_changed_at: now,
        }
    }

    pub fn set_state(&mut self, state: WorkerState, now: DateTime<Utc>) {
        self.state = state;
        self.state_changed_at = now;
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            script_url: self.script_url.to_string(),
            state: self.state,
        }
    }
}

/// Snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub script_url: String,
    pub state: WorkerState,
}

/// Snapshot of a registration, detached from platform state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct RegistrationInfo {
    pub scope: String,
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub last_update_check: Option<DateTime<Utc>>,
}

impl RegistrationInfo {
    pub fn has_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        if self.waiting.is_some() {
            LifecycleState::Waiting
        } else if self.active.is_some() {
            LifecycleState::Active
        } else if self.installing.is_some() {
            LifecycleState::Installing
        } else {
            LifecycleState::Unregistered
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Registration {
    pub scope: Url,
    pub installing: Option<Worker>,
    pub waiting: Option<Worker>,
    pub active: Option<Worker>,
    pub last_update_check: Option<DateTime<Utc>>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// The most recently installed worker, whatever its slot.
    pub fn newest(&self) -> Option<&Worker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Put a fresh worker into the installing slot.
    ///
    /// Returns a previous installing worker, now redundant.
    pub fn begin_install(&mut self, worker: Worker, now: DateTime<Utc>) -> Option<Worker> {
        let replaced = self.installing.replace(worker);
        replaced.map(|mut old| {
            old.set_state(WorkerState::Redundant, now);
            old
        })
    }

    /// Transition installing to waiting.
    ///
    /// Returns a previously waiting worker, now redundant.
    pub fn install_complete(&mut self, now: DateTime<Utc>) -> Option<Worker> {
        let mut worker = self.installing.take()?;
        worker.set_state(WorkerState::Installed, now);
        let displaced = self.waiting.replace(worker);
        displaced.map(|mut old| {
            old.set_state(WorkerState::Redundant, now);
            old
        })
    }

    /// Promote the waiting worker to active.
    ///
    /// Returns the retired active worker, now redundant. No-op without a
    /// waiting worker.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Option<Worker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(WorkerState::Activating, now);
        let retired = self.active.take().map(|mut old| {
            old.set_state(WorkerState::Redundant, now);
            old
        });
        worker.set_state(WorkerState::Activated, now);
        self.active = Some(worker);
        retired
    }

    /// Mark every worker redundant and empty all slots.
    pub fn unregister(&mut self, now: DateTime<Utc>) -> Vec<Worker> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
            .map(|mut worker| {
                worker.set_state(WorkerState::Redundant, now);
                worker
            })
            .collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
    }

    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            scope: self.scope.to_string(),
            installing: self.installing.as_ref().map(Worker::info),
            waiting: self.waiting.as_ref().map(Worker::info),
            active: self.active.as_ref().map(Worker::info),
            last_update_check: self.last_update_check,
        }
    }
}
