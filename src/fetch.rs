//! Network access to the asset origin.
//!
//! Executors and the precache engine only see the [`Fetcher`] trait, so the
//! origin can be swapped for a scripted stub in tests.  A fetch that returns
//! any HTTP status is `Ok`; only transport failures (connect errors, resets,
//! timeouts, truncated bodies) are `Err`.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::debug;

use crate::config::OriginConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A fully received origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchedAsset {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over the asset origin.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` (origin-relative path plus query).
    async fn fetch(&self, url: &str) -> Result<FetchedAsset>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: url::Url,
}

impl HttpFetcher {
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Self::with_client(client, &config.base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let origin = url::Url::parse(base_url)
            .with_context(|| format!("invalid origin URL: {base_url}"))?;
        Ok(Self { client, origin })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Absolute origin URL for an origin-relative path.
    pub fn origin_url(&self, url: &str) -> Result<url::Url> {
        self.origin
            .join(url)
            .with_context(|| format!("cannot resolve {url} against origin {}", self.origin))
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset> {
        let target = self.origin_url(url)?;
        let response = self
            .client
            .get(target.clone())
            .send()
            .await
            .with_context(|| format!("request to {target} failed"))?;

        let status = response.status().as_u16();
        let headers = header_pairs(response.headers());
        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body from {target}"))?;

        debug!(%target, status, bytes = body.len(), "fetched from origin");
        Ok(FetchedAsset {
            status,
            headers,
            body,
        })
    }
}

/// Flatten a header map, dropping values that are not valid UTF-8.
pub fn header_pairs(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Test stub
// ---------------------------------------------------------------------------
