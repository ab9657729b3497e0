//! Client span ingest pipeline.
//!
//! One POST endpoint receives batch envelopes from the plugin, web, and CLI
//! tiers. Each request runs the same pipeline: decode and validate, resolve
//! the authenticated caller, authorize every referenced trace, mask
//! sensitive attributes, rate-limit, persist. A batch is accepted in full or
//! rejected in full, and duplicate spans are idempotent no-ops, so client
//! retries are always safe.

pub mod mask;
pub mod ownership;
pub mod rate_limit;
pub mod validate;

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use tracing::warn;

use sidechain_telemetry::{BatchEnvelope, IngestResponse, TraceId};

use crate::config::IngestConfig;
use crate::db::Database;
use crate::error::{ErrorCode, Result, SidechainError};
use crate::middleware::AuthContext;
use ownership::{OwnershipClaim, TraceOwnership};
use rate_limit::{IngestRateLimiter, RateDecision};

/// The ingest pipeline. One instance per process, shared across requests.
pub struct IngestService {
    db: Database,
    ownership: TraceOwnership,
    limiter: IngestRateLimiter,
    max_batch_bytes: usize,
    retention_days: u32,
}

impl IngestService {
    pub fn new(db: Database, config: &IngestConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            ownership: TraceOwnership::new(
                config.ownership_entries_per_shard,
                config.retention_days,
            ),
            limiter: IngestRateLimiter::new(config.rate_per_user_per_min, config.rate_burst),
            max_batch_bytes: config.max_batch_bytes,
            retention_days: config.retention_days,
        })
    }

    /// Run the full pipeline for one request body.
    pub async fn process(&self, caller: &AuthContext, body: &[u8]) -> Result<IngestResponse> {
        // 1. Size cap, then decode, then span invariants. Validation errors
        //    are terminal; the client drops the batch.
        if body.len() > self.max_batch_bytes {
            return Err(SidechainError::payload_too_large(
                body.len(),
                self.max_batch_bytes,
            ));
        }
        let mut envelope: BatchEnvelope = serde_json::from_slice(body)
            .map_err(|e| SidechainError::malformed_payload(format!("invalid envelope: {}", e)))?;
        validate::validate_envelope(&envelope)?;

        // 2. Authentication happened in middleware; `caller` is the proof.

        // 3. Authorize every distinct trace in the batch against its owner.
        let mut trace_ids: Vec<TraceId> = envelope.spans.iter().map(|s| s.trace_id).collect();
        trace_ids.sort();
        trace_ids.dedup();
        for trace_id in &trace_ids {
            self.authorize_trace(*trace_id, &caller.user_id).await?;
        }

        // 4. Mask sensitive attributes before anything can be stored.
        let mut masked = 0;
        for span in &mut envelope.spans {
            masked += mask::mask_span(span);
        }
        if masked > 0 {
            counter!("telemetry_ingest_masked_attributes_total").increment(masked as u64);
        }

        // 5. Rate limit by user.
        if let RateDecision::Limited { retry_after_secs } = self.limiter.check(&caller.user_id) {
            return Err(SidechainError::rate_limited(retry_after_secs));
        }

        // 6. Persist atomically; duplicates are counted, not errors.
        let outcome = self
            .db
            .insert_client_spans(
                &caller.user_id,
                envelope.client_kind.as_str(),
                &envelope.client_version,
                &envelope.spans,
            )
            .await
            .map_err(|e| match e.code() {
                ErrorCode::UpstreamUnavailable => e,
                _ => SidechainError::upstream_unavailable("span store unavailable"),
            })?;

        counter!("telemetry_ingest_spans_accepted_total").increment(outcome.accepted);
        counter!("telemetry_ingest_spans_skipped_total").increment(outcome.skipped_duplicates);

        // 7. Acknowledge with what actually landed.
        Ok(IngestResponse {
            accepted: outcome.accepted,
            skipped_duplicates: outcome.skipped_duplicates,
        })
    }

    /// Resolve and check ownership for one trace.
    ///
    /// The cached owner wins. On a miss, the server root span's user is
    /// consulted first, then the earliest client reporter in the retention
    /// window; whichever exists seeds the cache. A store outage during
    /// resolution degrades to "unknown": the batch will still refuse to
    /// persist, so no ownership can be stolen while the store is down.
    async fn authorize_trace(&self, trace_id: TraceId, user_id: &str) -> Result<()> {
        if self.ownership.cached_owner(trace_id).is_none() {
            if let Some((owner, claimed_at)) = self.resolve_stored_owner(trace_id).await {
                self.ownership.record_owner(trace_id, &owner, claimed_at);
            }
        }

        match self.ownership.claim(trace_id, user_id) {
            OwnershipClaim::Owned => Ok(()),
            OwnershipClaim::Conflict { owner } => {
                warn!(
                    trace_id = %trace_id,
                    claimed_by = user_id,
                    owned_by = %owner,
                    "cross-user trace claim refused"
                );
                counter!("telemetry_ingest_trace_conflicts_total").increment(1);
                Err(SidechainError::forbidden_trace(trace_id))
            }
        }
    }

    async fn resolve_stored_owner(
        &self,
        trace_id: TraceId,
    ) -> Option<(String, chrono::DateTime<Utc>)> {
        let window_start = Utc::now() - Duration::days(self.retention_days as i64);

        match self.db.server_root_owner(trace_id).await {
            Ok(Some(owner)) => return Some((owner, Utc::now())),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "owner lookup in server spans failed");
                return None;
            }
        }

        match self.db.first_client_reporter(trace_id, window_start).await {
            Ok(Some(owner)) => Some((owner, Utc::now())),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "owner lookup in client spans failed");
                None
            }
        }
    }

    /// Owner of a trace for the query surface, resolved like ingest does.
    pub async fn trace_owner(&self, trace_id: TraceId) -> Option<String> {
        if let Some(owner) = self.ownership.cached_owner(trace_id) {
            return Some(owner);
        }
        let resolved = self.resolve_stored_owner(trace_id).await;
        if let Some((owner, claimed_at)) = &resolved {
            self.ownership.record_owner(trace_id, owner, *claimed_at);
        }
        resolved.map(|(owner, _)| owner)
    }
}
