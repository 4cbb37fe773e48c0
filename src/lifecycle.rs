//! Cache generations.
//!
//! Every store partition name carries a generation tag
//! (`{prefix}-{version}-{partition}`).  Exactly one generation is active at
//! a time; activation atomically swaps the active tag and then sweeps every
//! other partition carrying the application prefix.  Lookups always go
//! through the active [`Generation`], so once the swap has happened no
//! request can reach an older generation's entries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::cache::CacheStore;
use crate::policy::Target;
use crate::precache::{PrecacheEngine, PrecacheReport};
use crate::strategy::{Partition, Resolution};

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation {
    prefix: String,
    version: String,
}

impl Generation {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `{prefix}-{version}`, e.g. `aether-assets-v2`.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.prefix, self.version)
    }

    pub fn partition_name(&self, partition: Partition) -> String {
        format!("{}-{}", self.tag(), partition)
    }

    pub fn partition_names(&self) -> Vec<String> {
        Partition::ALL
            .into_iter()
            .map(|p| self.partition_name(p))
            .collect()
    }

    /// Whether the store partition `name` belongs to this generation.
    pub fn owns(&self, name: &str) -> bool {
        Partition::ALL
            .into_iter()
            .any(|p| self.partition_name(p) == name)
    }

    /// Whether `name` carries this application's prefix at all.
    fn shares_prefix(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Executor target for a resolved request.
    pub fn target(&self, resolution: &Resolution) -> Target {
        Target {
            partition: self.partition_name(resolution.partition),
            policy: resolution.policy,
            limit: resolution.limit,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Installing,
    /// Populated and waiting for activation.
    Installed,
    Active,
    Superseded,
    Removed,
}

/// Generation tag of a store partition name (`{tag}-{partition}`).
fn tag_of(name: &str) -> &str {
    name.rsplit_once('-').map(|(tag, _)| tag).unwrap_or(name)
}

// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

pub struct LifecycleManager {
    prefix: String,
    store: Arc<dyn CacheStore>,
    precache: PrecacheEngine,
    critical_assets: Vec<String>,
    active: watch::Sender<Option<Arc<Generation>>>,
    states: DashMap<String, GenerationState>,
}

impl LifecycleManager {
    pub fn new(
        prefix: impl Into<String>,
        store: Arc<dyn CacheStore>,
        precache: PrecacheEngine,
        critical_assets: Vec<String>,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            prefix: prefix.into(),
            store,
            precache,
            critical_assets,
            active,
            states: DashMap::new(),
        }
    }

    pub fn precache(&self) -> &PrecacheEngine {
        &self.precache
    }

    /// The generation lookups currently go through, if one was activated.
    pub fn active(&self) -> Option<Arc<Generation>> {
        self.active.borrow().clone()
    }

    pub fn state(&self, tag: &str) -> Option<GenerationState> {
        self.states.get(tag).map(|s| *s)
    }

    fn set_state(&self, tag: String, state: GenerationState) {
        info!(generation = %tag, ?state, "generation state changed");
        self.states.insert(tag, state);
    }

    /// Create `version`'s partitions and populate the critical asset set.
    ///
    /// A critical asset that cannot be fetched is logged and skipped; only a
    /// store that cannot create partitions aborts the install.
    #[instrument(skip(self))]
    pub async fn install(&self, version: &str) -> Result<(Arc<Generation>, PrecacheReport)> {
        let generation = Arc::new(Generation::new(self.prefix.clone(), version));
        self.set_state(generation.tag(), GenerationState::Installing);

        for name in generation.partition_names() {
            self.store
                .create_partition(&name)
                .await
                .with_context(|| format!("failed to create partition {name}"))?;
        }

        let report = self.precache.run(&generation, &self.critical_assets).await;
        for failure in &report.failures {
            warn!(url = %failure.url, error = %failure.error, "critical asset skipped");
        }

        self.set_state(generation.tag(), GenerationState::Installed);
        Ok((generation, report))
    }

    /// Make `generation` the active one and delete every other generation's
    /// partitions.  Returns the number of partitions removed.
    #[instrument(skip(self, generation), fields(generation = %generation))]
    pub async fn activate(&self, generation: Arc<Generation>) -> Result<usize> {
        let previous = self.active.send_replace(Some(Arc::clone(&generation)));
        self.set_state(generation.tag(), GenerationState::Active);
        if let Some(previous) = previous.filter(|p| p.tag() != generation.tag()) {
            self.set_state(previous.tag(), GenerationState::Superseded);
        }

        let partitions = self
            .store
            .list_partitions()
            .await
            .context("failed to list partitions for activation sweep")?;

        let mut swept: BTreeMap<String, bool> = BTreeMap::new();
        let mut removed = 0;
        for name in partitions {
            if !generation.shares_prefix(&name) || generation.owns(&name) {
                continue;
            }
            let tag = tag_of(&name).to_string();
            if !swept.contains_key(&tag) {
                self.set_state(tag.clone(), GenerationState::Superseded);
            }
            match self.store.delete_partition(&name).await {
                Ok(_) => {
                    removed += 1;
                    swept.entry(tag).or_insert(true);
                }
                Err(e) => {
                    warn!(partition = %name, error = %e, "failed to delete superseded partition");
                    swept.insert(tag, false);
                }
            }
        }

        for (tag, complete) in swept {
            if complete {
                self.set_state(tag, GenerationState::Removed);
            }
        }

        info!(removed, "generation activated");
        Ok(removed)
    }

    /// Delete every partition of the active generation and re-create them
    /// empty.
    pub async fn clear(&self) -> Result<()> {
        let generation = self.active().context("no active generation")?;
        for name in generation.partition_names() {
            self.store
                .delete_partition(&name)
                .await
                .with_context(|| format!("failed to delete partition {name}"))?;
            self.store
                .create_partition(&name)
                .await
                .with_context(|| format!("failed to re-create partition {name}"))?;
        }
        info!(generation = %generation, "cleared active generation");
        Ok(())
    }

    /// Entry counts per partition of the active generation.
    pub async fn sizes(&self) -> Result<BTreeMap<String, usize>> {
        let generation = self.active().context("no active generation")?;
        let mut sizes = BTreeMap::new();
        for name in generation.partition_names() {
            let count = self
                .store
                .count(&name)
                .await
                .with_context(|| format!("failed to count partition {name}"))?;
            sizes.insert(name, count);
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::cache::{CacheKey, CachedResponse};
    use crate::config::{PartitionLimits, PrecacheConfig};
    use crate::fetch::testing::StubFetcher;
    use crate::metrics::MetricsRegistry;
    use crate::policy::PolicyExecutor;
    use crate::strategy::StrategyResolver;

    const LOGO: &str = "/assets/webp/aether-brand-logo-main.webp";
    const MANIFEST: &str = "/assets/manifest/master-manifest.json";

    fn manager(store: Arc<MemoryStore>, fetcher: Arc<StubFetcher>) -> LifecycleManager {
        let metrics = MetricsRegistry::new();
        let executor = PolicyExecutor::new(store.clone(), fetcher, metrics.clone(), None);
        let precache = PrecacheEngine::new(
            executor,
            StrategyResolver::new(PartitionLimits::default()),
            metrics,
            &PrecacheConfig::default(),
        );
        LifecycleManager::new(
            "aether-assets",
            store,
            precache,
            vec![LOGO.to_string(), MANIFEST.to_string()],
        )
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::get(path).unwrap()
    }

    #[test]
    fn generation_naming() {
        let generation = Generation::new("aether-assets", "v2");
        assert_eq!(generation.tag(), "aether-assets-v2");
        assert_eq!(
            generation.partition_name(Partition::Thumbs),
            "aether-assets-v2-thumbs"
        );
        assert!(generation.owns("aether-assets-v2-lqip"));
        assert!(!generation.owns("aether-assets-v20-lqip"));
        assert!(!generation.owns("aether-assets-v1-lqip"));
        assert!(generation.shares_prefix("aether-assets-v1-lqip"));
        assert!(!generation.shares_prefix("aether-assetsv1-lqip"));
        assert!(!generation.shares_prefix("other-cache"));
        assert_eq!(tag_of("aether-assets-v1-images"), "aether-assets-v1");
    }

    #[tokio::test]
    async fn install_survives_critical_asset_failure() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new();
        fetcher.respond(LOGO, 200, "logo");
        fetcher.fail(MANIFEST);
        let manager = manager(store.clone(), fetcher);

        let (generation, report) = manager.install("v2").await.unwrap();
        manager.precache().executor().settle().await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(manager.state("aether-assets-v2"), Some(GenerationState::Installed));
        assert!(manager.active().is_none());
        let images = generation.partition_name(Partition::Images);
        assert!(store.get(&images, &key(LOGO)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn activation_removes_older_generations() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new();
        fetcher.respond(LOGO, 200, "logo");
        fetcher.respond(MANIFEST, 200, "{}");
        store.create_partition("unrelated-cache").await.unwrap();
        let manager = manager(store.clone(), fetcher);

        let (g1, _) = manager.install("v1").await.unwrap();
        manager.activate(Arc::clone(&g1)).await.unwrap();
        let (g2, _) = manager.install("v2").await.unwrap();
        manager.precache().executor().settle().await;
        let removed = manager.activate(Arc::clone(&g2)).await.unwrap();

        assert_eq!(removed, Partition::ALL.len());
        assert_eq!(manager.active().as_deref(), Some(g2.as_ref()));
        assert_eq!(manager.state("aether-assets-v1"), Some(GenerationState::Removed));
        assert_eq!(manager.state("aether-assets-v2"), Some(GenerationState::Active));

        let g1_images = g1.partition_name(Partition::Images);
        assert!(store.get(&g1_images, &key(LOGO)).await.unwrap().is_none());
        assert!(store
            .put(&g1_images, &key(LOGO), CachedResponse::capture(200, &[], Bytes::new()))
            .await
            .is_err());

        let mut remaining = store.list_partitions().await.unwrap();
        remaining.sort();
        let mut expected = g2.partition_names();
        expected.push("unrelated-cache".to_string());
        expected.sort();
        assert_eq!(remaining, expected);
    }

    #[tokio::test]
    async fn leftover_partitions_from_earlier_runs_are_swept() {
        let store = Arc::new(MemoryStore::new());
        store.create_partition("aether-assets-v1-images").await.unwrap();
        store.create_partition("aether-assets-v1-thumbs").await.unwrap();
        let manager = manager(store.clone(), StubFetcher::new());

        let (generation, _) = manager.install("v2").await.unwrap();
        let removed = manager.activate(generation).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(manager.state("aether-assets-v1"), Some(GenerationState::Removed));
    }

    #[tokio::test]
    async fn clear_empties_and_recreates_active_partitions() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new();
        fetcher.respond(LOGO, 200, "logo");
        let manager = manager(store.clone(), fetcher);
        let (generation, _) = manager.install("v2").await.unwrap();
        manager.activate(Arc::clone(&generation)).await.unwrap();
        manager.precache().executor().settle().await;

        manager.clear().await.unwrap();

        let sizes = manager.sizes().await.unwrap();
        assert_eq!(sizes.len(), Partition::ALL.len());
        assert!(sizes.values().all(|&n| n == 0));
        // Partitions still accept writes after a clear.
        store
            .put(
                &generation.partition_name(Partition::Images),
                &key(LOGO),
                CachedResponse::capture(200, &[], Bytes::new()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clear_without_active_generation_fails() {
        let manager = manager(Arc::new(MemoryStore::new()), StubFetcher::new());
        assert!(manager.clear().await.is_err());
        assert!(manager.sizes().await.is_err());
    }
}
