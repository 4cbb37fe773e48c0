//! Batch precache engine.
//!
//! Populates the active generation ahead of real traffic.  URLs are fetched
//! in fixed-size batches; every URL is attempted exactly once and a failure
//! is recorded in the [`PrecacheReport`] instead of aborting the run.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheKey;
use crate::config::PrecacheConfig;
use crate::lifecycle::Generation;
use crate::metrics::MetricsRegistry;
use crate::policy::PolicyExecutor;
use crate::strategy::StrategyResolver;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecacheFailure {
    pub url: String,
    pub error: String,
}

/// Terminal outcome of one precache run.  Partial success is a valid result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrecacheReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<PrecacheFailure>,
}

impl PrecacheReport {
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Flatten an asset manifest into origin paths.
///
/// Expected shape: `{"assets": {"<category>": [{"files": {"<variant>":
/// "<path>"}}]}}`.  Anything that does not fit is skipped.
pub fn flatten_manifest(manifest: &Value, asset_base: &str) -> Vec<String> {
    let Some(assets) = manifest.get("assets").and_then(Value::as_object) else {
        debug!("manifest has no assets object");
        return Vec::new();
    };

    let base = asset_base.trim_end_matches('/');
    let mut urls = Vec::new();
    for (category, records) in assets {
        let Some(records) = records.as_array() else {
            debug!(%category, "skipping malformed manifest category");
            continue;
        };
        for record in records {
            let Some(files) = record.get("files").and_then(Value::as_object) else {
                debug!(%category, "skipping manifest record without files");
                continue;
            };
            for (variant, file) in files {
                match file.as_str() {
                    Some(file) if !file.is_empty() => {
                        urls.push(format!("{base}/{}", file.trim_start_matches('/')));
                    }
                    _ => debug!(%category, %variant, "skipping malformed file entry"),
                }
            }
        }
    }
    urls
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PrecacheEngine {
    executor: PolicyExecutor,
    resolver: StrategyResolver,
    metrics: MetricsRegistry,
    batch_size: usize,
    manifest_path: String,
    asset_base: String,
}

impl PrecacheEngine {
    pub fn new(
        executor: PolicyExecutor,
        resolver: StrategyResolver,
        metrics: MetricsRegistry,
        config: &PrecacheConfig,
    ) -> Self {
        Self {
            executor,
            resolver,
            metrics,
            batch_size: config.batch_size.max(1),
            manifest_path: config.manifest_path.clone(),
            asset_base: config.asset_base.clone(),
        }
    }

    pub fn executor(&self) -> &PolicyExecutor {
        &self.executor
    }

    /// Fetch and store every URL into `generation`'s partitions.
    #[instrument(skip(self, generation, urls), fields(generation = %generation.tag(), urls = urls.len()))]
    pub async fn run(&self, generation: &Generation, urls: &[String]) -> PrecacheReport {
        let mut report = PrecacheReport::default();

        for batch in urls.chunks(self.batch_size) {
            let results = join_all(batch.iter().map(|url| self.precache_one(generation, url))).await;
            for (url, result) in batch.iter().zip(results) {
                report.attempted += 1;
                match result {
                    Ok(()) => {
                        report.succeeded += 1;
                        self.metrics.metrics.precache_succeeded_total.inc();
                    }
                    Err(e) => {
                        warn!(%url, error = %e, "failed to precache asset");
                        self.metrics.metrics.precache_failed_total.inc();
                        report.failures.push(PrecacheFailure {
                            url: url.clone(),
                            error: format!("{e:#}"),
                        });
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "precache finished"
        );
        report
    }

    /// Fetch the configured manifest from the origin and precache every file
    /// it lists.
    pub async fn run_manifest(&self, generation: &Generation) -> Result<PrecacheReport> {
        let manifest = self
            .executor
            .fetcher()
            .fetch(&self.manifest_path)
            .await
            .with_context(|| format!("failed to fetch manifest {}", self.manifest_path))?;
        anyhow::ensure!(
            manifest.is_success(),
            "manifest {} answered {}",
            self.manifest_path,
            manifest.status
        );
        let manifest: Value =
            serde_json::from_slice(&manifest.body).context("manifest is not valid JSON")?;

        let urls = flatten_manifest(&manifest, &self.asset_base);
        info!(urls = urls.len(), "precaching manifest assets");
        Ok(self.run(generation, &urls).await)
    }

    async fn precache_one(&self, generation: &Generation, url: &str) -> Result<()> {
        let key = CacheKey::get(url)?;
        let (partition, limit) = self.resolver.precache_target(key.path());
        let response = self
            .executor
            .fetch_and_store(&key, &generation.partition_name(partition), limit)
            .await?;
        anyhow::ensure!(
            (200..300).contains(&response.status),
            "origin answered {}",
            response.status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::cache::CacheStore;
    use crate::config::{PartitionLimits, PrecacheConfig};
    use crate::fetch::testing::StubFetcher;
    use crate::strategy::Partition;

    async fn engine(batch_size: usize) -> (PrecacheEngine, Arc<MemoryStore>, Arc<StubFetcher>, Generation) {
        let store = Arc::new(MemoryStore::new());
        let generation = Generation::new("aether-assets", "v2");
        for partition in Partition::ALL {
            store
                .create_partition(&generation.partition_name(partition))
                .await
                .unwrap();
        }
        let fetcher = StubFetcher::new();
        let metrics = MetricsRegistry::new();
        let executor = PolicyExecutor::new(store.clone(), fetcher.clone(), metrics.clone(), None);
        let config = PrecacheConfig {
            batch_size,
            ..PrecacheConfig::default()
        };
        let engine = PrecacheEngine::new(
            executor,
            StrategyResolver::new(PartitionLimits::default()),
            metrics,
            &config,
        );
        (engine, store, fetcher, generation)
    }

    fn manifest() -> Value {
        json!({
            "assets": {
                "brand": [
                    {"id": "logo", "files": {"full": "webp/logo.webp", "blur": "lqip/logo-blur.webp"}},
                    {"id": "mark", "files": {"full": "webp/mark.webp", "blur": "lqip/mark-blur.webp"}}
                ],
                "gallery": [
                    {"id": "hero", "files": {"full": "webp/hero.webp", "thumb": "thumbnails/hero.webp"}}
                ]
            }
        })
    }

    #[test]
    fn flattens_every_file_variant() {
        let urls = flatten_manifest(&manifest(), "/assets");
        assert_eq!(urls.len(), 6);
        assert!(urls.contains(&"/assets/webp/logo.webp".to_string()));
        assert!(urls.contains(&"/assets/thumbnails/hero.webp".to_string()));
    }

    #[test]
    fn malformed_manifest_entries_are_skipped() {
        let manifest = json!({
            "assets": {
                "broken": "not-a-list",
                "mixed": [
                    {"files": {"full": "webp/ok.webp", "bad": 42, "empty": ""}},
                    {"id": "no-files"},
                    7
                ]
            }
        });
        assert_eq!(flatten_manifest(&manifest, "/assets/"), vec!["/assets/webp/ok.webp"]);
        assert!(flatten_manifest(&json!({"version": 1}), "/assets").is_empty());
    }

    #[tokio::test]
    async fn partial_failure_completes_with_report() {
        let (engine, store, fetcher, generation) = engine(4).await;
        let urls = flatten_manifest(&manifest(), "/assets");
        for url in &urls {
            fetcher.respond(url, 200, "asset");
        }
        fetcher.fail("/assets/lqip/mark-blur.webp");

        let report = engine.run(&generation, &urls).await;
        engine.executor.settle().await;

        assert_eq!(fetcher.calls(), 6);
        assert_eq!(report.attempted, 6);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].url, "/assets/lqip/mark-blur.webp");
        assert!(!report.is_complete_success());

        let lqip = generation.partition_name(Partition::Lqip);
        assert_eq!(store.count(&lqip).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let (engine, store, fetcher, generation) = engine(10).await;
        fetcher.respond("/assets/webp/gone.webp", 404, "missing");

        let report = engine
            .run(&generation, &["/assets/webp/gone.webp".to_string()])
            .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failures[0].error, "origin answered 404");
        let images = generation.partition_name(Partition::Images);
        assert_eq!(store.count(&images).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unmanaged_urls_land_in_static() {
        let (engine, store, fetcher, generation) = engine(10).await;
        fetcher.respond("/index.html", 200, "<html>");

        let report = engine.run(&generation, &["/index.html".to_string()]).await;

        assert!(report.is_complete_success());
        let static_part = generation.partition_name(Partition::Static);
        assert_eq!(store.count(&static_part).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn manifest_run_fetches_manifest_then_assets() {
        let (engine, _store, fetcher, generation) = engine(10).await;
        fetcher.respond(
            "/assets/manifest/aether-website-assets-manifest.json",
            200,
            r#"{"assets":{"a":[{"files":{"full":"webp/a.webp","thumb":"thumbnails/a.webp"}}]}}"#,
        );
        fetcher.respond("/assets/webp/a.webp", 200, "a");
        fetcher.respond("/assets/thumbnails/a.webp", 200, "a");

        let report = engine.run_manifest(&generation).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(fetcher.requested()[0], "/assets/manifest/aether-website-assets-manifest.json");
    }

    #[tokio::test]
    async fn unreachable_manifest_is_an_error() {
        let (engine, _store, _fetcher, generation) = engine(10).await;
        assert!(engine.run_manifest(&generation).await.is_err());
    }
}
