//! On-disk [`CacheStore`] backend.
//!
//! Each partition is a directory under `{base_path}/{partition}`.  An entry
//! is two files named by the SHA-256 digest of its key: `{digest}.json` with
//! status, headers, timestamp and the insertion sequence number, and
//! `{digest}-{seq}.body` with the raw payload written under that sequence.
//! Both are written to a temporary name and renamed into place.  The body
//! goes first; renaming the metadata is the commit point, so the metadata on
//! disk always names the body it was written with.  A body without
//! committed metadata is swept when the partition is loaded.
//!
//! The index of a partition is loaded lazily from its metadata files the
//! first time the partition is touched, which is how partitions left behind
//! by earlier runs (and earlier generations) become visible to the
//! activation sweep.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::entry::{CacheKey, CachedResponse};
use super::index::PartitionIndex;
use super::store::CacheStore;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Persisted metadata for one entry.  The body lives in a sibling file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: CacheKey,
    seq: u64,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: DateTime<Utc>,
}

type PartitionHandle = Arc<Mutex<PartitionIndex<EntryMeta>>>;

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

/// Persistent store rooted at `base_path`.
pub struct DiskStore {
    base_path: PathBuf,
    partitions: RwLock<HashMap<String, PartitionHandle>>,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `base_path`.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path)
            .await
            .with_context(|| format!("failed to create cache dir: {}", base_path.display()))?;
        Ok(Self {
            base_path,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    /// Directory for a partition.  Names are generation-qualified identifiers
    /// and must stay a single path component.
    fn partition_dir(&self, partition: &str) -> Result<PathBuf> {
        anyhow::ensure!(
            !partition.is_empty()
                && partition != "."
                && partition != ".."
                && partition
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
            "invalid partition name: {partition:?}"
        );
        Ok(self.base_path.join(partition))
    }

    /// Return the handle for `partition`, loading it from disk on first use.
    /// With `create`, a missing partition directory is created.
    async fn handle(&self, partition: &str, create: bool) -> Result<Option<PartitionHandle>> {
        if let Some(handle) = self.partitions.read().await.get(partition) {
            return Ok(Some(Arc::clone(handle)));
        }

        let dir = self.partition_dir(partition)?;
        let mut partitions = self.partitions.write().await;
        if let Some(handle) = partitions.get(partition) {
            return Ok(Some(Arc::clone(handle)));
        }

        let index = if dir.is_dir() {
            load_index(&dir).await?
        } else if create {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create partition dir: {}", dir.display()))?;
            PartitionIndex::default()
        } else {
            return Ok(None);
        };

        let handle = Arc::new(Mutex::new(index));
        partitions.insert(partition.to_string(), Arc::clone(&handle));
        Ok(Some(handle))
    }
}

#[async_trait::async_trait]
impl CacheStore for DiskStore {
    async fn create_partition(&self, partition: &str) -> Result<()> {
        self.handle(partition, true).await?;
        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await.with_context(|| {
            format!("failed to read cache dir: {}", self.base_path.display())
        })?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedResponse>> {
        let Some(handle) = self.handle(partition, false).await? else {
            return Ok(None);
        };
        let index = handle.lock().await;
        if index.removed {
            return Ok(None);
        }
        let Some(meta) = index.get(key) else {
            return Ok(None);
        };

        let body_path = self
            .partition_dir(partition)?
            .join(body_file(key, meta.seq));
        let body = tokio::fs::read(&body_path)
            .await
            .with_context(|| format!("failed to read cached body: {}", body_path.display()))?;

        Ok(Some(CachedResponse {
            status: meta.status,
            headers: meta.headers.clone(),
            body: Bytes::from(body),
            cached_at: meta.cached_at,
        }))
    }

    async fn put(&self, partition: &str, key: &CacheKey, response: CachedResponse) -> Result<()> {
        let handle = self
            .handle(partition, false)
            .await?
            .ok_or_else(|| anyhow::anyhow!("partition {partition} does not exist"))?;
        let mut index = handle.lock().await;
        anyhow::ensure!(!index.removed, "partition {partition} was deleted");

        let dir = self.partition_dir(partition)?;
        let meta = EntryMeta {
            key: key.clone(),
            seq: index.next_seq(),
            status: response.status,
            headers: response.headers,
            cached_at: response.cached_at,
        };
        let meta_json = serde_json::to_vec(&meta).context("failed to encode entry metadata")?;

        let body_path = dir.join(body_file(key, meta.seq));
        write_atomic(&body_path, &response.body).await?;
        if let Err(e) = write_atomic(&dir.join(meta_file(key)), &meta_json).await {
            // Not committed: the previous metadata still names its own body.
            if let Err(cleanup) = remove_if_exists(&body_path).await {
                warn!(path = %body_path.display(), error = %cleanup, "failed to remove uncommitted body");
            }
            return Err(e);
        }

        if let Some(previous) = index.insert_at(meta.seq, key.clone(), meta) {
            let stale = dir.join(body_file(key, previous.seq));
            if let Err(e) = remove_if_exists(&stale).await {
                warn!(path = %stale.display(), error = %e, "failed to remove replaced body");
            }
        }
        debug!(%partition, %key, "entry written to disk");
        Ok(())
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
        let Some(handle) = self.handle(partition, false).await? else {
            return Ok(Vec::new());
        };
        let index = handle.lock().await;
        if index.removed {
            return Ok(Vec::new());
        }
        Ok(index.keys())
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool> {
        let Some(handle) = self.handle(partition, false).await? else {
            return Ok(false);
        };
        let mut index = handle.lock().await;
        let Some(meta) = index.remove(key) else {
            return Ok(false);
        };
        let dir = self.partition_dir(partition)?;
        remove_entry_files(&dir, &meta).await?;
        Ok(true)
    }

    async fn trim(&self, partition: &str, limit: usize) -> Result<Vec<CacheKey>> {
        let Some(handle) = self.handle(partition, false).await? else {
            return Ok(Vec::new());
        };
        let mut index = handle.lock().await;
        if index.removed {
            return Ok(Vec::new());
        }
        let dir = self.partition_dir(partition)?;

        let mut evicted = Vec::new();
        for (key, meta) in index.trim_oldest(limit) {
            // Already gone from the index; a leftover file only matters
            // after a restart, where it reloads as an ordinary entry.
            if let Err(e) = remove_entry_files(&dir, &meta).await {
                warn!(%partition, %key, error = %e, "failed to remove evicted entry files");
            }
            evicted.push(key);
        }
        Ok(evicted)
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        let dir = self.partition_dir(partition)?;
        // The map stays write-locked until the directory is gone, otherwise a
        // concurrent reader could reload the half-deleted directory.
        let mut partitions = self.partitions.write().await;
        let handle = partitions.remove(partition);
        // Hold the partition lock so no in-flight put lands after removal.
        let guard = match &handle {
            Some(handle) => {
                let mut index = handle.lock().await;
                index.removed = true;
                Some(index)
            }
            None => None,
        };

        let result = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(handle.is_some()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove partition dir: {}", dir.display())),
        };
        drop(guard);
        drop(partitions);
        result
    }

    async fn count(&self, partition: &str) -> Result<usize> {
        let Some(handle) = self.handle(partition, false).await? else {
            return Ok(0);
        };
        let index = handle.lock().await;
        Ok(if index.removed { 0 } else { index.len() })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn body_file(key: &CacheKey, seq: u64) -> String {
    format!("{}-{seq}.body", key.digest())
}

fn meta_file(key: &CacheKey) -> String {
    format!("{}.json", key.digest())
}

/// Remove an entry's metadata, then its body.
async fn remove_entry_files(dir: &Path, meta: &EntryMeta) -> Result<()> {
    remove_if_exists(&dir.join(meta_file(&meta.key))).await?;
    remove_if_exists(&dir.join(body_file(&meta.key, meta.seq))).await
}

/// Rebuild a partition index from the metadata files in `dir`.  Unreadable
/// metadata and metadata whose body is missing are skipped.  Bodies and
/// temporary files left by uncommitted writes are removed.
async fn load_index(dir: &Path) -> Result<PartitionIndex<EntryMeta>> {
    let mut metas = Vec::new();
    let mut bodies = HashSet::new();
    let mut leftovers = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read partition dir: {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {}
            Some("body") => {
                bodies.insert(entry.file_name().to_string_lossy().into_owned());
                continue;
            }
            Some("tmp") => {
                leftovers.push(path);
                continue;
            }
            _ => continue,
        }
        match read_meta(&path).await {
            Ok(meta) => metas.push(meta),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable cache metadata");
            }
        }
    }

    metas.retain(|meta| {
        let present = bodies.remove(&body_file(&meta.key, meta.seq));
        if !present {
            warn!(dir = %dir.display(), key = %meta.key, "skipping cache metadata without body");
        }
        present
    });
    leftovers.extend(bodies.into_iter().map(|name| dir.join(name)));
    for path in leftovers {
        if let Err(e) = remove_if_exists(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove uncommitted cache file");
        }
    }

    metas.sort_by_key(|m| m.seq);
    let mut index = PartitionIndex::default();
    for meta in metas {
        index.insert_at(meta.seq, meta.key.clone(), meta);
    }
    debug!(dir = %dir.display(), entries = index.len(), "loaded partition index");
    Ok(index)
}

async fn read_meta(path: &Path) -> Result<EntryMeta> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::get(path).unwrap()
    }

    fn response(text: &'static str) -> CachedResponse {
        CachedResponse::capture(
            200,
            &[("content-type".to_string(), "image/webp".to_string())],
            Bytes::from_static(text.as_bytes()),
        )
    }

    #[tokio::test]
    async fn entries_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.create_partition("app-v1-images").await.unwrap();
            store.put("app-v1-images", &key("/a"), response("a")).await.unwrap();
            store.put("app-v1-images", &key("/b"), response("b")).await.unwrap();
            store.put("app-v1-images", &key("/a"), response("a2")).await.unwrap();
        }

        let store = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.list_partitions().await.unwrap(),
            vec!["app-v1-images".to_string()]
        );
        assert_eq!(
            store.keys("app-v1-images").await.unwrap(),
            vec![key("/b"), key("/a")]
        );
        let got = store.get("app-v1-images", &key("/a")).await.unwrap().unwrap();
        assert_eq!(got.body, Bytes::from_static(b"a2"));
        assert_eq!(got.status, 200);
        assert_eq!(got.header("Content-Type"), Some("image/webp"));

        // New inserts continue after the persisted sequence.
        store.put("app-v1-images", &key("/c"), response("c")).await.unwrap();
        assert_eq!(
            store.keys("app-v1-images").await.unwrap(),
            vec![key("/b"), key("/a"), key("/c")]
        );
    }

    #[tokio::test]
    async fn delete_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create_partition("p").await.unwrap();
        store.put("p", &key("/a"), response("a")).await.unwrap();

        assert!(store.delete("p", &key("/a")).await.unwrap());
        assert!(!store.delete("p", &key("/a")).await.unwrap());
        let leftover = std::fs::read_dir(dir.path().join("p")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn deleted_partition_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create_partition("p").await.unwrap();
        store.put("p", &key("/a"), response("a")).await.unwrap();

        assert!(store.delete_partition("p").await.unwrap());
        assert!(!dir.path().join("p").exists());
        assert!(store.get("p", &key("/a")).await.unwrap().is_none());
        assert!(store.put("p", &key("/a"), response("a")).await.is_err());
        assert!(!store.delete_partition("p").await.unwrap());
    }

    #[tokio::test]
    async fn missing_body_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create_partition("p").await.unwrap();
        store.put("p", &key("/a"), response("a")).await.unwrap();
        std::fs::remove_file(dir.path().join("p").join(body_file(&key("/a"), 0))).unwrap();

        assert!(store.get("p", &key("/a")).await.is_err());
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn replacing_an_entry_keeps_one_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create_partition("p").await.unwrap();
        store.put("p", &key("/a"), response("a")).await.unwrap();
        store.put("p", &key("/a"), response("a2")).await.unwrap();

        let mut expected = vec![body_file(&key("/a"), 1), meta_file(&key("/a"))];
        expected.sort();
        assert_eq!(files_in(&dir.path().join("p")), expected);
        let got = store.get("p", &key("/a")).await.unwrap().unwrap();
        assert_eq!(got.body, Bytes::from_static(b"a2"));
    }

    #[tokio::test]
    async fn uncommitted_body_does_not_replace_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cached_at = {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.create_partition("p").await.unwrap();
            store.put("p", &key("/a"), response("a")).await.unwrap();
            store.get("p", &key("/a")).await.unwrap().unwrap().cached_at
        };

        // A write that stopped after its body but before its metadata.
        let part = dir.path().join("p");
        std::fs::write(part.join(body_file(&key("/a"), 1)), b"torn").unwrap();
        std::fs::write(part.join(format!("{}.tmp", meta_file(&key("/a")))), b"{").unwrap();

        let store = DiskStore::open(dir.path()).await.unwrap();
        let got = store.get("p", &key("/a")).await.unwrap().unwrap();
        assert_eq!(got.body, Bytes::from_static(b"a"));
        assert_eq!(got.cached_at, cached_at);

        let mut expected = vec![body_file(&key("/a"), 0), meta_file(&key("/a"))];
        expected.sort();
        assert_eq!(files_in(&part), expected);
    }

    #[tokio::test]
    async fn trim_removes_oldest_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create_partition("p").await.unwrap();
        for path in ["/a", "/b", "/c"] {
            store.put("p", &key(path), response("x")).await.unwrap();
        }

        assert_eq!(store.trim("p", 1).await.unwrap(), vec![key("/a"), key("/b")]);
        assert!(store.trim("p", 1).await.unwrap().is_empty());
        assert!(store.trim("missing", 1).await.unwrap().is_empty());

        let mut expected = vec![body_file(&key("/c"), 2), meta_file(&key("/c"))];
        expected.sort();
        assert_eq!(files_in(&dir.path().join("p")), expected);

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.keys("p").await.unwrap(), vec![key("/c")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn trim_racing_a_reinsert_keeps_the_fresh_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());

        for round in 0..50 {
            let partition = format!("p{round}");
            store.create_partition(&partition).await.unwrap();
            for path in ["/a", "/b", "/c"] {
                store.put(&partition, &key(path), response("x")).await.unwrap();
            }

            let writer = tokio::spawn({
                let store = Arc::clone(&store);
                let partition = partition.clone();
                async move {
                    store
                        .put(&partition, &key("/a"), response("fresh"))
                        .await
                        .unwrap()
                }
            });
            let trimmer = tokio::spawn({
                let store = Arc::clone(&store);
                let partition = partition.clone();
                async move { store.trim(&partition, 2).await.unwrap() }
            });
            writer.await.unwrap();
            trimmer.await.unwrap();

            let got = store.get(&partition, &key("/a")).await.unwrap().unwrap();
            assert_eq!(got.body, Bytes::from_static(b"fresh"));
            assert_eq!(
                store.keys(&partition).await.unwrap().last(),
                Some(&key("/a"))
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_with_concurrent_readers_leaves_partition_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());
        store.create_partition("p").await.unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = tokio::spawn({
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            async move {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    store.count("p").await.unwrap();
                    store.keys("p").await.unwrap();
                    tokio::task::yield_now().await;
                }
            }
        });

        for _ in 0..200 {
            store.put("p", &key("/a"), response("a")).await.unwrap();
            store.put("p", &key("/b"), response("b")).await.unwrap();
            assert!(store.delete_partition("p").await.unwrap());
            store.create_partition("p").await.unwrap();
            assert_eq!(store.count("p").await.unwrap(), 0);
            assert!(store.get("p", &key("/a")).await.unwrap().is_none());
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn partition_names_cannot_escape_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        assert!(store.create_partition("../evil").await.is_err());
        assert!(store.create_partition("..").await.is_err());
    }
}
