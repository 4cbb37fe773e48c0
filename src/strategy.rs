//! Strategy resolution for managed asset requests.
//!
//! A request path is matched against a fixed, ordered rule table.  The first
//! matching rule names the partition the asset lives in and the caching
//! policy that governs it.  Paths that match no rule are not managed by the
//! proxy and are passed through to the origin untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PartitionLimits;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Logical cache partition.  Each one maps to exactly one store partition
/// per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Images,
    Thumbs,
    Lqip,
    Static,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Images,
        Partition::Thumbs,
        Partition::Lqip,
        Partition::Static,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Partition::Images => "images",
            Partition::Thumbs => "thumbs",
            Partition::Lqip => "lqip",
            Partition::Static => "static",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Caching policy, identified symbolically so that the rule table never
/// needs to know about executor internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::CacheFirst => "cache-first",
            Policy::NetworkFirst => "network-first",
            Policy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a managed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub partition: Partition,
    pub policy: Policy,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

struct Rule {
    /// Any of these substrings in the path selects the rule.
    needles: &'static [&'static str],
    partition: Partition,
    policy: Policy,
}

/// Ordered; first match wins.  Placeholders must stay ahead of images since
/// `/lqip/` assets are webp files too.
const RULES: &[Rule] = &[
    Rule {
        needles: &["/lqip/"],
        partition: Partition::Lqip,
        policy: Policy::CacheFirst,
    },
    Rule {
        needles: &["/thumbnails/", "-thumb"],
        partition: Partition::Thumbs,
        policy: Policy::StaleWhileRevalidate,
    },
    Rule {
        needles: &["/webp/", "/avif/", "/png-fallback/"],
        partition: Partition::Images,
        policy: Policy::CacheFirst,
    },
    Rule {
        needles: &["/manifest/"],
        partition: Partition::Static,
        policy: Policy::NetworkFirst,
    },
];

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Maps request paths to `(partition, policy, limit)` triples.
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    limits: PartitionLimits,
}

impl StrategyResolver {
    pub fn new(limits: PartitionLimits) -> Self {
        Self { limits }
    }

    /// Resolve a URL path.  Returns `None` for paths the proxy does not
    /// manage.  Any query string is ignored for matching.
    pub fn resolve(&self, path: &str) -> Option<Resolution> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        RULES
            .iter()
            .find(|rule| rule.needles.iter().any(|n| path.contains(n)))
            .map(|rule| Resolution {
                partition: rule.partition,
                policy: rule.policy,
                limit: self.limits.for_partition(rule.partition),
            })
    }

    /// Partition a proactively cached URL is stored in.  Unmanaged URLs land
    /// in [`Partition::Static`] alongside the critical set.
    pub fn precache_target(&self, path: &str) -> (Partition, usize) {
        match self.resolve(path) {
            Some(r) => (r.partition, r.limit),
            None => (
                Partition::Static,
                self.limits.for_partition(Partition::Static),
            ),
        }
    }

    pub fn limit(&self, partition: Partition) -> usize {
        self.limits.for_partition(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StrategyResolver {
        StrategyResolver::new(PartitionLimits::default())
    }

    #[test]
    fn lqip_is_cache_first_even_for_webp() {
        let r = resolver()
            .resolve("/assets/lqip/aether-brand-logo-main-blur.webp")
            .unwrap();
        assert_eq!(r.partition, Partition::Lqip);
        assert_eq!(r.policy, Policy::CacheFirst);
        assert_eq!(r.limit, 50);
    }

    #[test]
    fn thumbnails_use_stale_while_revalidate() {
        let r = resolver()
            .resolve("/assets/thumbnails/256/logo-256w.webp")
            .unwrap();
        assert_eq!(r.partition, Partition::Thumbs);
        assert_eq!(r.policy, Policy::StaleWhileRevalidate);
        assert_eq!(r.limit, 100);

        let r = resolver().resolve("/assets/webp/logo-thumb.webp").unwrap();
        assert_eq!(r.partition, Partition::Thumbs);
    }

    #[test]
    fn full_images_are_cache_first() {
        for path in [
            "/assets/webp/logo.webp",
            "/assets/avif/logo.avif",
            "/assets/png-fallback/logo.png",
        ] {
            let r = resolver().resolve(path).unwrap();
            assert_eq!(r.partition, Partition::Images, "{path}");
            assert_eq!(r.policy, Policy::CacheFirst);
        }
    }

    #[test]
    fn manifests_are_network_first() {
        let r = resolver()
            .resolve("/assets/manifest/master-manifest.json?v=3")
            .unwrap();
        assert_eq!(r.partition, Partition::Static);
        assert_eq!(r.policy, Policy::NetworkFirst);
        assert_eq!(r.limit, 20);
    }

    #[test]
    fn unmanaged_paths_resolve_to_none() {
        assert!(resolver().resolve("/assets/aether-assets.css").is_none());
        assert!(resolver().resolve("/index.html").is_none());
        // Needles in the query string do not count.
        assert!(resolver().resolve("/api/search?q=/webp/").is_none());
    }

    #[test]
    fn configured_limits_flow_through() {
        let limits = PartitionLimits {
            images: 2,
            ..PartitionLimits::default()
        };
        let r = StrategyResolver::new(limits)
            .resolve("/assets/webp/a.webp")
            .unwrap();
        assert_eq!(r.limit, 2);
    }

    #[test]
    fn precache_target_falls_back_to_static() {
        let (p, limit) = resolver().precache_target("/assets/aether-assets.js");
        assert_eq!(p, Partition::Static);
        assert_eq!(limit, 20);
    }

    #[test]
    fn partition_display_matches_name() {
        for p in Partition::ALL {
            assert_eq!(p.to_string(), p.name());
        }
    }
}
