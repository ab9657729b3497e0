//! Telemetry span persistence and the unified query surface.
//!
//! Client spans land in `client_telemetry_spans`; server spans are written by
//! the OTLP collector into `server_spans`. The `unified_spans` view fuses the
//! two under one schema keyed by trace id, and is the only interface exposed
//! to dashboards and operator queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use sidechain_telemetry::{SpanRecord, TraceId};

use super::Database;
use crate::error::Result;
use crate::instrument::traced_db;

/// One row of the `unified_spans` view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedSpan {
    /// Producing tier: `plugin`, `web`, `cli`, or `server`.
    pub source: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time_ms: i64,
    pub duration_ms: i64,
    pub status: String,
}

/// Result of persisting one batch.
#[derive(Debug, Clone, Copy)]
pub struct PersistOutcome {
    pub accepted: u64,
    pub skipped_duplicates: u64,
}

impl Database {
    /// Persist a batch of client spans for `user_id`. The whole batch lands
    /// in one transaction: it is accepted in full or not at all, which keeps
    /// client retries safe. Duplicate `(trace_id, span_id)` rows are
    /// idempotent no-ops.
    pub async fn insert_client_spans(
        &self,
        user_id: &str,
        client_kind: &str,
        client_version: &str,
        spans: &[SpanRecord],
    ) -> Result<PersistOutcome> {
        let pool = self.pool().clone();
        let user_id = user_id.to_string();
        let client_kind = client_kind.to_string();
        let client_version = client_version.to_string();
        let spans = spans.to_vec();

        traced_db("INSERT", "client_telemetry_spans", async move {
            let mut tx = pool.begin().await?;
            let mut accepted = 0u64;

            for span in &spans {
                let attributes = serde_json::to_value(&span.attributes)
                    .unwrap_or(serde_json::Value::Null);
                let events =
                    serde_json::to_value(&span.events).unwrap_or(serde_json::Value::Null);

                let result = sqlx::query(
                    r#"
                    INSERT INTO client_telemetry_spans
                        (trace_id, span_id, parent_span_id, name,
                         start_time_ms, end_time_ms, status, status_message,
                         attributes, events, client_kind, client_version,
                         user_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT (trace_id, span_id) DO NOTHING
                    "#,
                )
                .bind(span.trace_id.to_string())
                .bind(span.span_id.to_string())
                .bind(span.parent_span_id.map(|id| id.to_string()))
                .bind(&span.name)
                .bind(span.start_time_ms as i64)
                .bind(span.end_time_ms as i64)
                .bind(span.status.as_str())
                .bind(span.status_message.as_deref())
                .bind(attributes)
                .bind(events)
                .bind(&client_kind)
                .bind(&client_version)
                .bind(&user_id)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

                accepted += result.rows_affected();
            }

            tx.commit().await?;
            Ok(PersistOutcome {
                accepted,
                skipped_duplicates: spans.len() as u64 - accepted,
            })
        })
        .await
    }

    /// Every span known for a trace across all sources, ordered by start
    /// time. The primary debugging query.
    pub async fn trace(&self, trace_id: TraceId) -> Result<Vec<UnifiedSpan>> {
        let pool = self.pool().clone();
        traced_db("SELECT", "unified_spans", async move {
            let rows = sqlx::query(
                r#"
                SELECT source, trace_id, span_id, parent_span_id, name,
                       start_time_ms, duration_ms, status
                FROM unified_spans
                WHERE trace_id = $1
                ORDER BY start_time_ms ASC
                "#,
            )
            .bind(trace_id.to_string())
            .fetch_all(&pool)
            .await?;

            Ok(rows
                .iter()
                .map(|row| UnifiedSpan {
                    source: row.get("source"),
                    trace_id: row.get("trace_id"),
                    span_id: row.get("span_id"),
                    parent_span_id: row.get("parent_span_id"),
                    name: row.get("name"),
                    start_time_ms: row.get("start_time_ms"),
                    duration_ms: row.get("duration_ms"),
                    status: row.get("status"),
                })
                .collect())
        })
        .await
    }

    /// Trace ids whose slowest span exceeds `min_duration_ms`, newest first.
    pub async fn slow_traces(
        &self,
        min_duration_ms: u64,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<String>> {
        let pool = self.pool().clone();
        traced_db("SELECT", "unified_spans", async move {
            let since_ms = since.timestamp_millis();
            let rows = sqlx::query(
                r#"
                SELECT trace_id
                FROM unified_spans
                WHERE start_time_ms >= $1
                GROUP BY trace_id
                HAVING MAX(duration_ms) >= $2
                ORDER BY MAX(duration_ms) DESC
                LIMIT $3
                "#,
            )
            .bind(since_ms)
            .bind(min_duration_ms as i64)
            .bind(limit as i64)
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(|row| row.get("trace_id")).collect())
        })
        .await
    }

    /// The user recorded on the server root span for a trace, if the
    /// collector has written one.
    pub async fn server_root_owner(&self, trace_id: TraceId) -> Result<Option<String>> {
        let pool = self.pool().clone();
        traced_db("SELECT", "server_spans", async move {
            let row = sqlx::query(
                r#"
                SELECT user_id FROM server_spans
                WHERE trace_id = $1 AND parent_span_id IS NULL
                ORDER BY start_time_ms ASC
                LIMIT 1
                "#,
            )
            .bind(trace_id.to_string())
            .fetch_optional(&pool)
            .await?;

            Ok(row.and_then(|r| r.get::<Option<String>, _>("user_id")))
        })
        .await
    }

    /// The user who first reported a client span for a trace within the
    /// retention window.
    pub async fn first_client_reporter(
        &self,
        trace_id: TraceId,
        window_start: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let pool = self.pool().clone();
        traced_db("SELECT", "client_telemetry_spans", async move {
            let row = sqlx::query(
                r#"
                SELECT user_id FROM client_telemetry_spans
                WHERE trace_id = $1 AND created_at >= $2
                ORDER BY created_at ASC
                LIMIT 1
                "#,
            )
            .bind(trace_id.to_string())
            .bind(window_start)
            .fetch_optional(&pool)
            .await?;

            Ok(row.map(|r| r.get("user_id")))
        })
        .await
    }

    /// Delete up to `batch` client spans older than `cutoff`. Returns the
    /// number of rows removed; callers loop until it reports zero.
    pub async fn prune_client_spans(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64> {
        let pool = self.pool().clone();
        traced_db("DELETE", "client_telemetry_spans", async move {
            let result = sqlx::query(
                r#"
                DELETE FROM client_telemetry_spans
                WHERE (trace_id, span_id) IN (
                    SELECT trace_id, span_id FROM client_telemetry_spans
                    WHERE created_at < $1
                    LIMIT $2
                )
                "#,
            )
            .bind(cutoff)
            .bind(batch as i64)
            .execute(&pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
