use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::strategy::Policy;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub policy: PolicyLabel,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PolicyLabel {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl From<Policy> for PolicyLabel {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::CacheFirst => PolicyLabel::CacheFirst,
            Policy::NetworkFirst => PolicyLabel::NetworkFirst,
            Policy::StaleWhileRevalidate => PolicyLabel::StaleWhileRevalidate,
        }
    }
}

/// How a managed request was answered.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Hit,
    Miss,
    Stale,
    Unavailable,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub result: FetchResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchResult {
    Ok,
    HttpError,
    NetworkError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PartitionLabels {
    pub partition: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<RequestLabels, Counter>,
    pub passthrough_total: Counter,

    // -- origin --
    pub upstream_fetches_total: Family<FetchLabels, Counter>,

    // -- store --
    pub store_errors_total: Counter,
    pub evicted_entries_total: Family<PartitionLabels, Counter>,
    pub partition_entries: Family<PartitionLabels, Gauge>,

    // -- background --
    pub revalidations_total: Counter,
    pub revalidations_collapsed_total: Counter,
    pub precache_succeeded_total: Counter,
    pub precache_failed_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "assetcache_requests",
            "Managed asset requests by policy and outcome",
            requests_total.clone(),
        );

        let passthrough_total = Counter::default();
        registry.register(
            "assetcache_passthrough",
            "Requests forwarded to the origin without caching",
            passthrough_total.clone(),
        );

        let upstream_fetches_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "assetcache_upstream_fetches",
            "Origin fetches issued by the cache by result",
            upstream_fetches_total.clone(),
        );

        let store_errors_total = Counter::default();
        registry.register(
            "assetcache_store_errors",
            "Cache store operations that failed and were treated as a miss or no-op",
            store_errors_total.clone(),
        );

        let evicted_entries_total = Family::<PartitionLabels, Counter>::default();
        registry.register(
            "assetcache_evicted_entries",
            "Entries removed to keep partitions within their limit",
            evicted_entries_total.clone(),
        );

        let partition_entries = Family::<PartitionLabels, Gauge>::default();
        registry.register(
            "assetcache_partition_entries",
            "Entries currently held per partition",
            partition_entries.clone(),
        );

        let revalidations_total = Counter::default();
        registry.register(
            "assetcache_revalidations",
            "Background revalidations started",
            revalidations_total.clone(),
        );

        let revalidations_collapsed_total = Counter::default();
        registry.register(
            "assetcache_revalidations_collapsed",
            "Revalidations skipped because one was already in flight",
            revalidations_collapsed_total.clone(),
        );

        let precache_succeeded_total = Counter::default();
        registry.register(
            "assetcache_precache_succeeded",
            "Assets stored by precache operations",
            precache_succeeded_total.clone(),
        );

        let precache_failed_total = Counter::default();
        registry.register(
            "assetcache_precache_failed",
            "Assets that failed to precache",
            precache_failed_total.clone(),
        );

        Self {
            requests_total,
            passthrough_total,
            upstream_fetches_total,
            store_errors_total,
            evicted_entries_total,
            partition_entries,
            revalidations_total,
            revalidations_collapsed_total,
            precache_succeeded_total,
            precache_failed_total,
        }
    }

    pub fn record_request(&self, policy: Policy, outcome: Outcome) {
        self.requests_total
            .get_or_create(&RequestLabels {
                policy: policy.into(),
                outcome,
            })
            .inc();
    }

    pub fn record_fetch(&self, result: FetchResult) {
        self.upstream_fetches_total
            .get_or_create(&FetchLabels { result })
            .inc();
    }

    pub fn set_partition_entries(&self, partition: &str, entries: usize) {
        self.partition_entries
            .get_or_create(&PartitionLabels {
                partition: partition.to_string(),
            })
            .set(entries as i64);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counter_is_labelled() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .record_request(Policy::StaleWhileRevalidate, Outcome::Hit);
        let text = registry.encode().unwrap();
        assert!(text.contains("assetcache_requests_total"));
        assert!(text.contains("policy=\"StaleWhileRevalidate\""));
        assert!(text.contains("outcome=\"Hit\""));
    }

    #[test]
    fn partition_gauge_tracks_last_value() {
        let registry = MetricsRegistry::new();
        registry.metrics.set_partition_entries("aether-assets-v2-images", 7);
        registry.metrics.set_partition_entries("aether-assets-v2-images", 3);
        let gauge = registry
            .metrics
            .partition_entries
            .get_or_create(&PartitionLabels {
                partition: "aether-assets-v2-images".to_string(),
            })
            .get();
        assert_eq!(gauge, 3);
    }
}
