mod cache;
mod config;
mod control;
mod fetch;
mod health;
mod http;
mod lifecycle;
mod metrics;
mod policy;
mod precache;
mod strategy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::control::{ControlHandle, ControlService};
use crate::fetch::HttpFetcher;
use crate::lifecycle::LifecycleManager;
use crate::metrics::MetricsRegistry;
use crate::policy::PolicyExecutor;
use crate::precache::PrecacheEngine;
use crate::strategy::StrategyResolver;

/// Queued control commands before senders wait.
const CONTROL_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "assetcache", about = "Caching proxy for static site assets")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/assetcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub store: Arc<dyn CacheStore>,
    /// Origin client, also used for pass-through requests.
    pub origin: HttpFetcher,
    pub resolver: StrategyResolver,
    pub executor: PolicyExecutor,
    pub lifecycle: Arc<LifecycleManager>,
    pub control: ControlHandle,
}

/// Wire up the store, origin client, executors, lifecycle manager and
/// control channel.  Must run inside a tokio runtime.
async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let metrics = MetricsRegistry::new();
    let store = cache::build_store(&config.cache)
        .await
        .context("failed to open cache store")?;
    let origin = HttpFetcher::new(&config.origin)?;
    let resolver = StrategyResolver::new(config.cache.limits);

    let max_age = (config.cache.max_age_secs > 0)
        .then(|| Duration::from_secs(config.cache.max_age_secs));
    let executor = PolicyExecutor::new(
        Arc::clone(&store),
        Arc::new(origin.clone()),
        metrics.clone(),
        max_age,
    );

    let precache = PrecacheEngine::new(
        executor.clone(),
        resolver.clone(),
        metrics.clone(),
        &config.precache,
    );
    let lifecycle = Arc::new(LifecycleManager::new(
        config.cache.name_prefix.clone(),
        Arc::clone(&store),
        precache,
        config.precache.critical_assets.clone(),
    ));

    let service = Arc::new(ControlService::new(Arc::clone(&lifecycle), metrics.clone()));
    let (control, _dispatcher) = control::spawn_channel(service, CONTROL_QUEUE_DEPTH);

    Ok(AppState {
        config,
        metrics,
        store,
        origin,
        resolver,
        executor,
        lifecycle,
        control,
    })
}

/// Install the configured generation and make it the active one.
async fn start_generation(state: &AppState) -> Result<()> {
    let version = &state.config.cache.version;
    let (generation, report) = state
        .lifecycle
        .install(version)
        .await
        .with_context(|| format!("failed to install cache generation {version}"))?;
    tracing::info!(
        generation = %generation,
        critical_cached = report.succeeded,
        critical_failed = report.failures.len(),
        "cache generation installed"
    );

    let removed = state
        .lifecycle
        .activate(generation)
        .await
        .context("failed to activate cache generation")?;
    tracing::info!(removed_partitions = removed, "cache generation active");
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        origin = %config.origin.base_url,
        backend = ?config.cache.backend,
        "starting assetcache"
    );

    // ---- State ----
    let state = build_state(Arc::clone(&config)).await?;

    // ---- Generation ----
    start_generation(&state).await?;

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_http_server(s).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    // ---- Await shutdown ----
    let _ = http_handle.await;

    // Let trailing evictions and revalidations finish before exiting.
    state.executor.shutdown().await;

    tracing::info!("assetcache shut down cleanly");
    Ok(())
}
