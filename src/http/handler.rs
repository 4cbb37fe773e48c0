//! Main axum router and HTTP request handlers for the asset caching proxy.
//!
//! Routes:
//! - `GET  /healthz`  - Health check
//! - `GET  /metrics`  - Prometheus metrics
//! - `POST /control`  - Control channel (`PRECACHE`, `PRECACHE_ALL`, `CLEAR`, `GET_SIZES`)
//! - anything else    - Managed asset (cached) or pass-through to the origin

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{debug, error, instrument, warn};

use crate::cache::entry::is_hop_by_hop;
use crate::cache::CacheKey;
use crate::control::{ControlCommand, ControlReply};
use crate::metrics::Outcome;
use crate::policy::AssetResponse;
use crate::AppState;

/// Response header naming how a managed request was answered.
pub const CACHE_STATUS_HEADER: &str = "x-asset-cache";
/// Response header carrying when a cached payload was stored.
pub const CACHED_AT_HEADER: &str = "x-asset-cached-at";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/control", post(handle_control))
        .fallback(handle_asset)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Fallback for every other request.
///
/// A `GET` whose path the resolver manages is answered by the active
/// generation's policy executor.  Anything else, including managed paths
/// before a generation has been activated, goes to the origin unchanged.
#[instrument(skip(state, headers, body), fields(%method, %uri))]
async fn handle_asset(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if method == Method::GET {
        if let Some(resolution) = state.resolver.resolve(uri.path()) {
            match state.lifecycle.active() {
                Some(generation) => {
                    let key = CacheKey::get(path_and_query)
                        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
                    let target = generation.target(&resolution);
                    let response = state.executor.execute(&key, &target).await;
                    return Ok(asset_response(response));
                }
                None => debug!("no active generation, passing managed request through"),
            }
        }
    }

    passthrough(&state, method, path_and_query, &headers, body).await
}

/// `POST /control`
///
/// Accepts a control message and replies with its outcome.  Command failures
/// are reported in the reply body; only a malformed message is a 400.
async fn handle_control(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let command: ControlCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "rejecting malformed control message");
            let reply = ControlReply::failed(format!("invalid control message: {e}"));
            return Ok((StatusCode::BAD_REQUEST, Json(reply)).into_response());
        }
    };

    let reply = state.control.send(command).await?;
    Ok(Json(reply).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        origin: state.origin.clone(),
        store: Arc::clone(&state.store),
        lifecycle: Arc::clone(&state.lifecycle),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode().context("metrics encoding failed")?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Hit => "hit",
        Outcome::Miss => "miss",
        Outcome::Stale => "stale",
        Outcome::Unavailable => "unavailable",
    }
}

/// Copy end-to-end headers from `pairs`, skipping anything that is not a
/// valid header.
fn copy_headers<'a>(target: &mut HeaderMap, pairs: impl Iterator<Item = (&'a str, &'a [u8])>) {
    for (name, value) in pairs {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            target.append(name, value);
        }
    }
}

fn asset_response(asset: AssetResponse) -> Response {
    let mut response = Response::new(Body::from(asset.body));
    *response.status_mut() = StatusCode::from_u16(asset.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let headers = response.headers_mut();
    copy_headers(
        headers,
        asset
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );
    headers.insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(outcome_label(asset.outcome)),
    );
    if let Some(cached_at) = asset.cached_at {
        if let Ok(value) = HeaderValue::from_str(&cached_at.to_rfc3339()) {
            headers.insert(HeaderName::from_static(CACHED_AT_HEADER), value);
        }
    }
    response
}

/// Forward a request to the origin and stream the reply back uncached.
async fn passthrough(
    state: &AppState,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    state.metrics.metrics.passthrough_total.inc();

    let url = state
        .origin
        .origin_url(path_and_query)
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    debug!(%url, "passing request through to origin");

    let mut request = state.origin.client().request(method, url).body(body);
    for (name, value) in headers {
        if name == header::HOST || name == header::CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        request = request.header(name, value);
    }

    let upstream = request
        .send()
        .await
        .context("failed to reach origin")
        .map_err(AppError::Upstream)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = upstream.status();
    copy_headers(
        response.headers_mut(),
        upstream
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );
    *response.body_mut() = Body::from_stream(upstream.bytes_stream());
    Ok(response)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request cannot be mapped to an origin URL or cache key.
    BadRequest(String),
    /// The origin could not be reached for a pass-through request.
    Upstream(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Upstream(err) => {
                warn!(error = %err, "origin unreachable");
                (StatusCode::BAD_GATEWAY, format!("Bad gateway: {err:#}")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
