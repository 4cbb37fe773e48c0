//! Cache keys and stored entries.

use std::fmt;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Only `GET` requests are ever cached.
pub const CACHEABLE_METHOD: &str = "GET";

/// Headers that describe a single connection and must not be replayed from
/// the cache.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header (case-insensitive).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Canonical request identity: method plus path and query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Build the key for a `GET` of `raw`, which may be an origin-relative
    /// path (`/assets/a.webp?v=1`) or an absolute URL.  Absolute URLs are
    /// reduced to their path and query so that both forms share one entry.
    pub fn get(raw: &str) -> Result<Self> {
        let parsed = if raw.starts_with('/') {
            url::Url::parse("http://origin.invalid")
                .and_then(|base| base.join(raw))
                .with_context(|| format!("invalid asset path: {raw}"))?
        } else {
            url::Url::parse(raw).with_context(|| format!("invalid asset URL: {raw}"))?
        };

        let mut url = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            url.push('?');
            url.push_str(query);
        }

        Ok(Self {
            method: CACHEABLE_METHOD.to_string(),
            url,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Origin-relative path plus query.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path without the query string, used for strategy resolution.
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }

    /// Stable file-system safe digest of the key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ---------------------------------------------------------------------------
// CachedResponse
// ---------------------------------------------------------------------------

/// A fully received, successful origin response as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    /// Capture a response for storage, dropping hop-by-hop headers.
    pub fn capture(status: u16, headers: &[(String, String)], body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .cloned()
            .collect();
        Self {
            status,
            headers,
            body,
            cached_at: Utc::now(),
        }
    }

    /// Age of the entry relative to `now`.  Clock skew yields zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.cached_at).max(chrono::Duration::zero())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
