//! Partitioned response cache.
//!
//! Provides the [`CacheStore`] trait with an in-memory and an on-disk
//! backend, the entry/key types they hold, and the oldest-first eviction
//! controller that keeps each partition within its entry limit.

pub mod disk;
pub mod entry;
pub mod eviction;
mod index;
pub mod memory;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

pub use entry::{CacheKey, CachedResponse};
pub use store::CacheStore;

use crate::config::{CacheConfig, StoreBackend};

/// Build the store selected by the configuration.
pub async fn build_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StoreBackend::Disk => Ok(Arc::new(disk::DiskStore::open(&config.path).await?)),
    }
}
