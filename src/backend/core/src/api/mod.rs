//! HTTP surface.
//!
//! Routes:
//! - `POST /api/v1/telemetry/spans` — batch ingest (bearer token)
//! - `GET  /api/v1/telemetry/trace/:trace_id` — unified trace fetch (owner or admin)
//! - `GET  /api/v1/telemetry/traces/slow` — slow trace listing (admin)
//! - `GET  /health`, `GET /metrics` — unversioned, unauthenticated, untraced
//!
//! Layer order matters: tracing wraps auth so the auth middleware can stamp
//! `user.id` onto the request span, and both wrap the handlers.

pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::Cache;
use crate::config::Config;
use crate::db::Database;
use crate::ingest::IngestService;
use crate::middleware::{AuthLayer, TraceLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ingest: Arc<IngestService>,
    pub cache: Option<Cache>,
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Build the router with the full middleware stack.
pub fn build_router(state: AppState, config: &Config, auth: AuthLayer) -> Router {
    // Body limit sits above the ingest cap; the pipeline enforces the exact
    // byte boundary itself so the 413 carries our error code.
    let body_limit = config.ingest.max_batch_bytes * 2;

    Router::new()
        .route("/api/v1/telemetry/spans", post(handlers::ingest_spans))
        .route(
            "/api/v1/telemetry/trace/:trace_id",
            get(handlers::get_trace),
        )
        .route("/api/v1/telemetry/traces/slow", get(handlers::slow_traces))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(auth)
        .layer(TraceLayer::new())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
