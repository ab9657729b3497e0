//! Request handlers.
//!
//! All handlers return `Result<_, SidechainError>`; failures map to the
//! machine-readable error codes via `IntoResponse`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sidechain_telemetry::{IngestResponse, TraceId};

use super::AppState;
use crate::db::spans::UnifiedSpan;
use crate::error::{Result, SidechainError};
use crate::middleware::AuthContext;

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Telemetry Ingest
// ═══════════════════════════════════════════════════════════════════════════════

/// `POST /api/v1/telemetry/spans`
pub async fn ingest_spans(
    State(state): State<AppState>,
    caller: AuthContext,
    body: Bytes,
) -> Result<Json<IngestResponse>> {
    let response = state.ingest.process(&caller, &body).await?;
    Ok(Json(response))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Trace Queries
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub trace_id: String,
    pub spans: Vec<UnifiedSpan>,
}

/// `GET /api/v1/telemetry/trace/:trace_id`
///
/// Unified client + server spans for one trace, ordered by start time.
/// Visible to the trace owner and admins.
pub async fn get_trace(
    State(state): State<AppState>,
    caller: AuthContext,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceResponse>> {
    let trace_id: TraceId = trace_id
        .parse()
        .map_err(|_| SidechainError::malformed_payload("trace_id must be 32 hex chars"))?;

    if !caller.is_admin() {
        match state.ingest.trace_owner(trace_id).await {
            Some(owner) if owner == caller.user_id => {}
            Some(_) => return Err(SidechainError::forbidden_trace(trace_id)),
            None => return Err(SidechainError::not_found("trace", trace_id)),
        }
    }

    // Hot traces get re-fetched while someone is debugging; serve the fused
    // view from cache when we can. Cache failures never fail the query.
    let cache_key = format!("telemetry:trace:{}", trace_id);
    if let Some(cache) = &state.cache {
        if let Ok(Some(cached)) = cache.get(&cache_key).await {
            if let Ok(spans) = serde_json::from_str::<Vec<UnifiedSpan>>(&cached) {
                return Ok(Json(TraceResponse {
                    trace_id: trace_id.to_string(),
                    spans,
                }));
            }
        }
    }

    let spans = state.db.trace(trace_id).await?;
    if spans.is_empty() {
        return Err(SidechainError::not_found("trace", trace_id));
    }

    if let Some(cache) = &state.cache {
        if let Ok(serialized) = serde_json::to_string(&spans) {
            if let Err(e) = cache.set(&cache_key, &serialized, 30).await {
                tracing::debug!(error = %e, "trace cache write failed");
            }
        }
    }

    Ok(Json(TraceResponse {
        trace_id: trace_id.to_string(),
        spans,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SlowTracesQuery {
    pub min_duration_ms: u64,
    /// RFC 3339; defaults to 24 hours ago.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SlowTracesResponse {
    pub trace_ids: Vec<String>,
}

/// `GET /api/v1/telemetry/traces/slow`
///
/// Traces whose slowest span exceeds the threshold. Admin only: the result
/// crosses user boundaries.
pub async fn slow_traces(
    State(state): State<AppState>,
    caller: AuthContext,
    Query(query): Query<SlowTracesQuery>,
) -> Result<Json<SlowTracesResponse>> {
    if !caller.is_admin() {
        return Err(SidechainError::forbidden("admin role required"));
    }

    let since = query
        .since
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
    let limit = query.limit.unwrap_or(50).min(500);

    let trace_ids = state
        .db
        .slow_traces(query.min_duration_ms, since, limit)
        .await?;
    Ok(Json(SlowTracesResponse { trace_ids }))
}
