//! Core library for pwacache.
//!
//! Keeps a locally cached copy of static assets and remote JSON data for an
//! offline-capable client, detects newer versions of the background worker
//! and adopts them without leaving a page running stale code against fresh
//! data.
//!
//! Components, leaves first:
//! - [`cache`]: partitioned request → response storage with per-write expiration
//! - [`strategy`]: resource classification and the fetch strategy engine
//! - [`worker`]: worker registration state machine and lifecycle controller
//! - [`poller`]: periodic update checks and the "update available" signal
//! - [`purge`]: selective purge and full reset
//!
//! Platform-owned state (cache storage, worker registrations, local key-value
//! state, page reload, connectivity) is reached through capability traits so
//! every component re-queries it instead of trusting a remembered copy.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod network;
pub mod poller;
pub mod purge;
pub mod storage;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{OfflineApp, Platform};
pub use cache::{CacheBackend, CacheStore, CachedResponse, DiskCacheBackend, MemoryCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::Connectivity;
pub use data::DataService;
pub use diagnostics::DiagnosticReport;
pub use error::{CacheError, FetchError, StorageError, UpdateCheckFailed, WorkerError};
pub use host::{ChannelPageHost, PageHost, UpdateNotice};
pub use network::{HttpNetwork, Network, NetworkError, ResourceRequest, ResourceResponse};
pub use poller::UpdatePoller;
pub use purge::{PurgeReport, PurgeService, PurgeStepFailed, PurgeTarget};
pub use storage::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use strategy::{classify, FetchEngine, ResourceClass, Strategy, StrategyTable};
pub use worker::{LifecycleController, LifecycleState, LocalWorkerRuntime, WorkerPlatform};

/// Application version reported by diagnostics.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
