//! Health check endpoints

use crate::metrics;
use crate::shard::{ShardSnapshot, ShardState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: u32,
    pub shards_tracked: usize,
    pub shards_ready: usize,
    /// Ready or resuming
    pub shards_healthy: usize,
    pub guilds_total: u64,
}

/// Per-shard status listing
#[derive(Debug, Serialize)]
pub struct ShardsResponse {
    pub shards_total: u32,
    pub shards: Vec<ShardSnapshot>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    /// Zero until discovery resolved the shard total
    pub shards_total: Arc<AtomicU32>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(shard_state: ShardState, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            shard_state,
            shards_total: Arc::new(AtomicU32::new(0)),
            metrics,
        }
    }

    pub fn set_shards_total(&self, total: u32) {
        self.shards_total.store(total, Ordering::Relaxed);
    }
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/shards", get(shards_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shards_ready = state.shard_state.ready_shards();
    let response = ReadyResponse {
        ready: shards_ready > 0,
        shards_total: state.shards_total.load(Ordering::Relaxed),
        shards_tracked: state.shard_state.shard_count(),
        shards_ready,
        shards_healthy: state.shard_state.healthy_shards(),
        guilds_total: state.shard_state.total_guilds(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(handle) = state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()).into_response();
    };

    metrics::set_shards_ready(state.shard_state.ready_shards());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        handle.render(),
    )
        .into_response()
}

async fn shards_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ShardsResponse {
        shards_total: state.shards_total.load(Ordering::Relaxed),
        shards: state.shard_state.snapshot(),
    })
}
