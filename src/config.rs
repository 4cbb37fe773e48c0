use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::strategy::Partition;

// ---------------------------------------------------------------------------
// Top-level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub origin: OriginConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub precache: PrecacheConfig,
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URL every request path is resolved against
    /// (e.g. `https://assets.example.com`).
    pub base_url: String,
    /// Transport timeout for a single origin fetch.  A timeout is handled
    /// exactly like any other network failure.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "assetcache/0.1".to_string()
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `127.0.0.1:8787`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "127.0.0.1:8787".to_string()
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Prefix shared by every generation this proxy owns.  Partitions that do
    /// not carry it are never touched.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Version tag of the generation installed at startup.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub backend: StoreBackend,
    /// Root directory for the disk backend.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Cache-first entries older than this are refetched.  `0` disables the
    /// age check.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default)]
    pub limits: PartitionLimits,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            version: default_version(),
            backend: StoreBackend::default(),
            path: default_cache_path(),
            max_age_secs: default_max_age_secs(),
            limits: PartitionLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Disk,
}

fn default_name_prefix() -> String {
    "aether-assets".to_string()
}

fn default_version() -> String {
    "v2".to_string()
}

fn default_cache_path() -> String {
    "/var/cache/assetcache".to_string()
}

fn default_max_age_secs() -> u64 {
    30 * 24 * 60 * 60
}

/// Maximum entry count per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PartitionLimits {
    #[serde(default = "default_images_limit")]
    pub images: usize,
    #[serde(default = "default_thumbs_limit")]
    pub thumbs: usize,
    #[serde(default = "default_lqip_limit")]
    pub lqip: usize,
    #[serde(default = "default_static_limit", rename = "static")]
    pub static_assets: usize,
}

impl Default for PartitionLimits {
    fn default() -> Self {
        Self {
            images: default_images_limit(),
            thumbs: default_thumbs_limit(),
            lqip: default_lqip_limit(),
            static_assets: default_static_limit(),
        }
    }
}

impl PartitionLimits {
    pub fn for_partition(&self, partition: Partition) -> usize {
        match partition {
            Partition::Images => self.images,
            Partition::Thumbs => self.thumbs,
            Partition::Lqip => self.lqip,
            Partition::Static => self.static_assets,
        }
    }
}

fn default_images_limit() -> usize {
    50
}

fn default_thumbs_limit() -> usize {
    100
}

fn default_lqip_limit() -> usize {
    50
}

fn default_static_limit() -> usize {
    20
}

// ---------------------------------------------------------------------------
// Precache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PrecacheConfig {
    /// Populated synchronously when a generation is installed.
    #[serde(default = "default_critical_assets")]
    pub critical_assets: Vec<String>,
    /// Origin path of the asset manifest used by `PRECACHE_ALL`.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
    /// Prefix joined with manifest file paths.
    #[serde(default = "default_asset_base")]
    pub asset_base: String,
    /// Number of fetches in flight per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            critical_assets: default_critical_assets(),
            manifest_path: default_manifest_path(),
            asset_base: default_asset_base(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_critical_assets() -> Vec<String> {
    [
        "/assets/webp/aether-brand-logo-main.webp",
        "/assets/webp/aether-brand-ctch-logotype.webp",
        "/assets/lqip/aether-brand-logo-main-blur.webp",
        "/assets/lqip/aether-brand-ctch-logotype-blur.webp",
        "/assets/manifest/master-manifest.json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_manifest_path() -> String {
    "/assets/manifest/aether-website-assets-manifest.json".to_string()
}

fn default_asset_base() -> String {
    "/assets".to_string()
}

fn default_batch_size() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a YAML config document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid config YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    url::Url::parse(&config.origin.base_url)
        .with_context(|| format!("invalid origin.base_url: {}", config.origin.base_url))?;
    ensure_name_component("cache.version", &config.cache.version)?;
    ensure_name_component("cache.name_prefix", &config.cache.name_prefix)?;
    for partition in Partition::ALL {
        anyhow::ensure!(
            config.cache.limits.for_partition(partition) > 0,
            "cache.limits.{partition} must be at least 1"
        );
    }
    anyhow::ensure!(
        config.precache.batch_size > 0,
        "precache.batch_size must be at least 1"
    );
    Ok(())
}

/// Prefix and version become part of partition names, which the disk
/// backend stores as directory names: ASCII alphanumerics plus `-`, `_`
/// and `.` only.
fn ensure_name_component(field: &str, value: &str) -> Result<()> {
    anyhow::ensure!(!value.trim().is_empty(), "{field} must not be empty");
    anyhow::ensure!(
        value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "{field} may only contain ASCII letters, digits, '-', '_' and '.': {value:?}"
    );
    Ok(())
}
