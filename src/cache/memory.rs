//! In-process [`CacheStore`] backend.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, RwLock};

use super::entry::{CacheKey, CachedResponse};
use super::index::PartitionIndex;
use super::store::CacheStore;

type PartitionHandle = Arc<Mutex<PartitionIndex<CachedResponse>>>;

/// Volatile store.  One mutex per partition serialises writers; the outer
/// map lock is only held long enough to look a partition up.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, PartitionHandle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, name: &str) -> Option<PartitionHandle> {
        self.partitions.read().await.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn create_partition(&self, partition: &str) -> Result<()> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_default();
        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<String>> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedResponse>> {
        let Some(handle) = self.partition(partition).await else {
            return Ok(None);
        };
        let index = handle.lock().await;
        if index.removed {
            return Ok(None);
        }
        Ok(index.get(key).cloned())
    }

    async fn put(&self, partition: &str, key: &CacheKey, response: CachedResponse) -> Result<()> {
        let handle = self
            .partition(partition)
            .await
            .ok_or_else(|| anyhow::anyhow!("partition {partition} does not exist"))?;
        let mut index = handle.lock().await;
        anyhow::ensure!(!index.removed, "partition {partition} was deleted");
        index.insert(key.clone(), response);
        Ok(())
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
        let Some(handle) = self.partition(partition).await else {
            return Ok(Vec::new());
        };
        let index = handle.lock().await;
        if index.removed {
            return Ok(Vec::new());
        }
        Ok(index.keys())
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool> {
        match self.partition(partition).await {
            Some(handle) => Ok(handle.lock().await.remove(key).is_some()),
            None => Ok(false),
        }
    }

    async fn trim(&self, partition: &str, limit: usize) -> Result<Vec<CacheKey>> {
        let Some(handle) = self.partition(partition).await else {
            return Ok(Vec::new());
        };
        let mut index = handle.lock().await;
        Ok(index
            .trim_oldest(limit)
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        let removed = self.partitions.write().await.remove(partition);
        match removed {
            Some(handle) => {
                handle.lock().await.removed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self, partition: &str) -> Result<usize> {
        let Some(handle) = self.partition(partition).await else {
            return Ok(0);
        };
        let index = handle.lock().await;
        Ok(if index.removed { 0 } else { index.len() })
    }
}
