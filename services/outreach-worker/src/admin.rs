//! Admin HTTP endpoints
//!
//! Served on `worker.admin_addr` when configured:
//! - GET /health: queue counts, pool health, cache stats, limiter usage
//! - GET /metrics: Prometheus text exposition

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::runtime::Runtime;

#[derive(Clone)]
pub struct AdminState {
    pub runtime: Arc<Runtime>,
    pub prometheus: PrometheusHandle,
}

/// Build the admin router. `max_connections` caps concurrent requests.
pub fn build_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// 200 when the job queue is reachable, 503 otherwise.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let (healthy, body) = state.runtime.health().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
