//! Partitioned response cache.
//!
//! The platform owns the storage; this module reaches it through the
//! [`CacheBackend`] trait and layers per-partition expiration on top in
//! [`CacheStore`]. Any partition may be empty at any time because the
//! platform can evict under storage pressure.
//!
//! Backends:
//! - [`MemoryCacheBackend`]: in-process maps
//! - [`DiskCacheBackend`]: one directory per partition, one JSON file per entry

pub mod backend;
pub mod disk;
pub mod entry;
pub mod store;

pub use backend::{CacheBackend, EntryMeta, MemoryCacheBackend};
pub use disk::DiskCacheBackend;
pub use entry::{CachedResponse, RequestKey};
pub use store::{CacheStore, Expiration};
