use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::CacheStore;
use crate::fetch::HttpFetcher;
use crate::lifecycle::LifecycleManager;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub origin: CheckResult,
    pub store: CheckResult,
    pub generation: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub origin: HttpFetcher,
    pub store: Arc<dyn CacheStore>,
    pub lifecycle: Arc<LifecycleManager>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_origin(origin: &HttpFetcher) -> CheckResult {
    let url = match origin.origin_url("/") {
        Ok(url) => url,
        Err(e) => return CheckResult::unhealthy(format!("{e:#}")),
    };
    match origin.client().head(url.clone()).send().await {
        Ok(resp) if !resp.status().is_server_error() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {url} failed: {e}")),
    }
}

async fn check_store(store: &dyn CacheStore) -> CheckResult {
    match store.list_partitions().await {
        Ok(partitions) => CheckResult {
            ok: true,
            detail: Some(format!("{} partitions", partitions.len())),
        },
        Err(e) => CheckResult::unhealthy(format!("listing partitions failed: {e:#}")),
    }
}

fn check_generation(lifecycle: &LifecycleManager) -> CheckResult {
    match lifecycle.active() {
        Some(generation) => {
            let tag = generation.tag();
            let detail = match lifecycle.state(&tag) {
                Some(state) => format!("{tag} ({state:?})"),
                None => tag,
            };
            CheckResult {
                ok: true,
                detail: Some(detail),
            }
        }
        None => CheckResult::unhealthy("no active generation"),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Cached assets can still be served while the origin is down.
    if !checks.store.ok || !checks.generation.ok {
        HealthStatus::Unhealthy
    } else if !checks.origin.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (origin, store) = tokio::join!(
        check_origin(&state.origin),
        check_store(state.store.as_ref()),
    );
    let generation = check_generation(&state.lifecycle);

    let checks = HealthChecks {
        origin,
        store,
        generation,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
