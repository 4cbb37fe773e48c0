//! The [`CacheStore`] abstraction shared by the memory and disk backends.
//!
//! Every operation is scoped to a single, generation-qualified partition
//! name.  Entries inside a partition are ordered by insertion; a `put` for an
//! existing key replaces the entry and moves it to the newest position.
//! Reads through a partition that is being deleted see it as empty.

use anyhow::Result;

use super::entry::{CacheKey, CachedResponse};

/// Partitioned key/value store of cached responses.
///
/// Implementations must tolerate concurrent calls for the same partition:
/// writes are whole-entry replacements and readers never see a partially
/// written entry or a torn insertion order.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Create `partition` if it does not exist yet.
    async fn create_partition(&self, partition: &str) -> Result<()>;

    /// Names of every partition currently present, in no particular order.
    async fn list_partitions(&self) -> Result<Vec<String>>;

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedResponse>>;

    /// Insert or replace.  Fails when `partition` does not exist, so that a
    /// late writer cannot resurrect a deleted partition.
    async fn put(&self, partition: &str, key: &CacheKey, response: CachedResponse) -> Result<()>;

    /// Keys ordered oldest first.  An absent partition has no keys.
    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>>;

    /// Returns `true` if an entry was removed.
    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool>;

    /// Remove the oldest entries until at most `limit` remain, as one step
    /// under the partition's lock.  Returns the removed keys, oldest first.
    /// An absent partition trims nothing.
    async fn trim(&self, partition: &str, limit: usize) -> Result<Vec<CacheKey>>;

    /// Returns `true` if the partition existed.
    async fn delete_partition(&self, partition: &str) -> Result<bool>;

    async fn count(&self, partition: &str) -> Result<usize> {
        Ok(self.keys(partition).await?.len())
    }
}
