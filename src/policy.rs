//! Policy executors.
//!
//! The three caching policies share one state machine (lookup, maybe fetch,
//! maybe store, answer) and differ only in a small decision table, see
//! [`Plan`].  Whatever happens on the network, an executor always produces
//! an [`AssetResponse`]: transport failures become a stale cached answer or
//! a synthesized `503`, never an error.
//!
//! Only complete `2xx` origin responses are written to the store.  Trailing
//! work (eviction after a write, background revalidation) is spawned on a
//! [`TaskTracker`] so it never delays the response; [`PolicyExecutor::settle`]
//! waits for it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::cache::eviction;
use crate::cache::{CacheKey, CacheStore, CachedResponse};
use crate::fetch::{FetchedAsset, Fetcher};
use crate::metrics::{FetchResult, MetricsRegistry, Outcome, PartitionLabels};
use crate::strategy::Policy;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a managed request is served from: a generation-scoped store
/// partition, the policy for it, and the partition's entry limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub partition: String,
    pub policy: Policy,
    pub limit: usize,
}

/// Answer handed back to the caller of [`PolicyExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub outcome: Outcome,
    /// When the served payload entered the cache, for cached answers.
    pub cached_at: Option<DateTime<Utc>>,
}

impl AssetResponse {
    fn from_cache(entry: CachedResponse, outcome: Outcome) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            outcome,
            cached_at: Some(entry.cached_at),
        }
    }

    fn from_network(asset: FetchedAsset) -> Self {
        Self {
            status: asset.status,
            headers: asset.headers,
            body: asset.body,
            outcome: Outcome::Miss,
            cached_at: None,
        }
    }

    fn unavailable(message: &'static str) -> Self {
        Self {
            status: 503,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: Bytes::from_static(message.as_bytes()),
            outcome: Outcome::Unavailable,
            cached_at: None,
        }
    }
}

/// Per-policy decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// Ask the origin before the store.
    network_first: bool,
    /// Answer hits immediately and refresh them in the background.
    revalidate_hits: bool,
    /// Treat hits older than the configured maximum age as expired.
    honour_max_age: bool,
}

impl Plan {
    fn for_policy(policy: Policy) -> Self {
        match policy {
            Policy::CacheFirst => Plan {
                network_first: false,
                revalidate_hits: false,
                honour_max_age: true,
            },
            Policy::NetworkFirst => Plan {
                network_first: true,
                revalidate_hits: false,
                honour_max_age: false,
            },
            Policy::StaleWhileRevalidate => Plan {
                network_first: false,
                revalidate_hits: true,
                honour_max_age: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyExecutor
// ---------------------------------------------------------------------------

/// Turns managed requests into responses while keeping the store current.
#[derive(Clone)]
pub struct PolicyExecutor {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    metrics: MetricsRegistry,
    max_age: Option<chrono::Duration>,
    tasks: TaskTracker,
    /// `(partition, key)` pairs with a revalidation in flight.
    revalidating: Arc<DashSet<(String, CacheKey)>>,
}

impl PolicyExecutor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        metrics: MetricsRegistry,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            store,
            fetcher,
            metrics,
            max_age: max_age.and_then(|d| chrono::Duration::from_std(d).ok()),
            tasks: TaskTracker::new(),
            revalidating: Arc::new(DashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Answer a request for `key` under `target`'s policy.
    #[instrument(skip(self, target), fields(%key, partition = %target.partition, policy = %target.policy))]
    pub async fn execute(&self, key: &CacheKey, target: &Target) -> AssetResponse {
        let plan = Plan::for_policy(target.policy);
        let response = if plan.network_first {
            self.run_network_first(key, target).await
        } else {
            self.run_cache_first(key, target, plan).await
        };

        debug!(status = response.status, outcome = ?response.outcome, "request answered");
        self.metrics
            .metrics
            .record_request(target.policy, response.outcome);
        response
    }

    /// Wait until every trailing eviction and revalidation spawned so far has
    /// finished.
    #[cfg(test)]
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Drain background work for shutdown.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Fetch `key` from the origin and, on a `2xx`, store it in `partition`
    /// and schedule eviction down to `limit`.  Non-success responses are
    /// returned but not stored.  `Err` means the network failed.
    pub async fn fetch_and_store(
        &self,
        key: &CacheKey,
        partition: &str,
        limit: usize,
    ) -> Result<AssetResponse> {
        let fetched = match self.fetcher.fetch(key.url()).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.metrics.metrics.record_fetch(FetchResult::NetworkError);
                return Err(e);
            }
        };

        if !fetched.is_success() {
            self.metrics.metrics.record_fetch(FetchResult::HttpError);
            debug!(status = fetched.status, "origin answered without success, not caching");
            return Ok(AssetResponse::from_network(fetched));
        }

        self.metrics.metrics.record_fetch(FetchResult::Ok);
        let entry = CachedResponse::capture(fetched.status, &fetched.headers, fetched.body.clone());
        match self.store.put(partition, key, entry).await {
            Ok(()) => self.spawn_eviction(partition.to_string(), limit),
            Err(e) => self.store_error(&e, "put"),
        }

        Ok(AssetResponse::from_network(fetched))
    }

    /// Trim `partition` to `limit` now.  Store failures are logged.
    pub async fn evict(&self, partition: &str, limit: usize) {
        match eviction::enforce_limit(self.store.as_ref(), partition, limit).await {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    self.metrics
                        .metrics
                        .evicted_entries_total
                        .get_or_create(&PartitionLabels {
                            partition: partition.to_string(),
                        })
                        .inc_by(evicted.len() as u64);
                }
                if let Ok(count) = self.store.count(partition).await {
                    self.metrics.metrics.set_partition_entries(partition, count);
                }
            }
            Err(e) => self.store_error(&e, "evict"),
        }
    }

    // -----------------------------------------------------------------------
    // State machines
    // -----------------------------------------------------------------------

    async fn run_network_first(&self, key: &CacheKey, target: &Target) -> AssetResponse {
        match self.fetch_and_store(key, &target.partition, target.limit).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "origin fetch failed, falling back to cache");
                match self.lookup(key, target).await {
                    Some(entry) => AssetResponse::from_cache(entry, Outcome::Stale),
                    None => AssetResponse::unavailable("Network unavailable"),
                }
            }
        }
    }

    async fn run_cache_first(&self, key: &CacheKey, target: &Target, plan: Plan) -> AssetResponse {
        let Some(entry) = self.lookup(key, target).await else {
            // Nothing to serve immediately, so every lookup-first policy
            // behaves like cache-first on a miss.
            return match self.fetch_and_store(key, &target.partition, target.limit).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "origin fetch failed on cache miss");
                    AssetResponse::unavailable("Asset unavailable offline")
                }
            };
        };

        if plan.honour_max_age && !self.is_fresh(&entry) {
            debug!(cached_at = %entry.cached_at, "cached entry expired, refetching");
            return match self.fetch_and_store(key, &target.partition, target.limit).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "origin fetch failed, serving expired entry");
                    AssetResponse::from_cache(entry, Outcome::Stale)
                }
            };
        }

        if plan.revalidate_hits {
            self.spawn_revalidation(key.clone(), target.clone());
        }
        AssetResponse::from_cache(entry, Outcome::Hit)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn lookup(&self, key: &CacheKey, target: &Target) -> Option<CachedResponse> {
        match self.store.get(&target.partition, key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.store_error(&e, "get");
                None
            }
        }
    }

    fn is_fresh(&self, entry: &CachedResponse) -> bool {
        match self.max_age {
            Some(max_age) => entry.age(Utc::now()) < max_age,
            None => true,
        }
    }

    fn store_error(&self, error: &anyhow::Error, operation: &'static str) {
        self.metrics.metrics.store_errors_total.inc();
        warn!(error = %error, operation, "cache store failure treated as miss");
    }

    fn spawn_eviction(&self, partition: String, limit: usize) {
        let this = self.clone();
        self.tasks.spawn(async move {
            this.evict(&partition, limit).await;
        });
    }

    /// Refresh a served hit in the background.  Failure leaves the cached
    /// entry untouched and only shows up in the log.
    fn spawn_revalidation(&self, key: CacheKey, target: Target) {
        let id = (target.partition.clone(), key.clone());
        if !self.revalidating.insert(id.clone()) {
            self.metrics.metrics.revalidations_collapsed_total.inc();
            debug!(%key, "revalidation already in flight");
            return;
        }
        self.metrics.metrics.revalidations_total.inc();

        let this = self.clone();
        self.tasks.spawn(async move {
            match this.fetch_and_store(&key, &target.partition, target.limit).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    debug!(%key, "revalidated cached entry");
                }
                Ok(response) => {
                    debug!(%key, status = response.status, "revalidation kept cached entry");
                }
                Err(e) => {
                    warn!(%key, error = %e, "revalidation failed, keeping cached entry");
                }
            }
            this.revalidating.remove(&id);
        });
    }
}
