//! Health, readiness, status, and metrics HTTP surface (A3). One axum
//! router shared by `/health`, `/health/live`, `/health/ready`, `/status`,
//! and `/metrics`.

use crate::supervisor::Shared;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HttpState {
    pub shared: Arc<Shared>,
    pub prometheus: PrometheusHandle,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness: the process is scheduling tasks at all. Never touches the
/// cache or registry locks, so it can't be blocked by a wedged dependency.
async fn live() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness: the cache connection actually answers. Distinguishes "the
/// binary is up" from "the binary can serve current data" per spec.md §6.
async fn ready(State(state): State<HttpState>) -> impl IntoResponse {
    let (up, _) = check_cache(&state).await;
    if up {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// Registered component checks. Only the cache is a genuine dependency
/// today (the registry and COV table are in-process); every other
/// component reporting is a placeholder an external BACnet layer would
/// extend.
async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let (up, cache_detail) = check_cache(&state).await;
    let body = Json(serde_json::json!({
        "components": { "cache": cache_detail },
    }));
    let status = if up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body)
}

async fn check_cache(state: &HttpState) -> (bool, serde_json::Value) {
    let mut cache = state.shared.cache.lock().await;
    match cache.get_cursor("__health_check__").await {
        Ok(_) => (true, serde_json::json!({ "status": "UP" })),
        Err(e) => (
            false,
            serde_json::json!({ "status": "DOWN", "error": e.to_string() }),
        ),
    }
}

async fn status(State(state): State<HttpState>) -> impl IntoResponse {
    let object_count = state.shared.registry.lock().await.len();
    let subscription_count = state.shared.cov.lock().await.len();
    Json(serde_json::json!({
        "object_count": object_count,
        "cov_subscription_count": subscription_count,
    }))
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    state.prometheus.render()
}
