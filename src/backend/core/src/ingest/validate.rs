//! Batch envelope validation.
//!
//! Decoding guarantees well-formed ids (the id types reject zero and bad
//! hex); this module checks everything else the span model promises before a
//! batch may touch storage. A single bad span rejects the whole batch so
//! client retry semantics stay simple.

use sidechain_telemetry::span::{
    MAX_ATTRIBUTES_PER_SPAN, MAX_ATTRIBUTE_BYTES, MAX_EVENTS_PER_SPAN, MAX_NAME_LEN,
    MAX_STATUS_MESSAGE_LEN,
};
use sidechain_telemetry::{BatchEnvelope, ClientKind, SpanRecord};

use crate::error::{Result, SidechainError};

/// Check every invariant of the span model for a decoded envelope.
pub fn validate_envelope(envelope: &BatchEnvelope) -> Result<()> {
    if envelope.spans.is_empty() {
        return Err(SidechainError::invariant_violation(
            "envelope contains no spans",
        ));
    }
    if matches!(envelope.client_kind, ClientKind::Server) {
        return Err(SidechainError::invariant_violation(
            "client_kind must be plugin, web, or cli",
        ));
    }
    if envelope.client_version.is_empty() || envelope.client_version.len() > 32 {
        return Err(SidechainError::invariant_violation(
            "client_version must be 1..=32 chars",
        ));
    }

    for (index, span) in envelope.spans.iter().enumerate() {
        validate_span(span)
            .map_err(|e| SidechainError::invariant_violation(format!("span {}: {}", index, e)))?;
    }
    Ok(())
}

fn validate_span(span: &SpanRecord) -> std::result::Result<(), String> {
    if let Some(parent) = span.parent_span_id {
        if parent == span.span_id {
            return Err("span_id equals parent_span_id".into());
        }
    }
    if span.name.is_empty() || span.name.len() > MAX_NAME_LEN {
        return Err(format!("name must be 1..={} chars", MAX_NAME_LEN));
    }
    if span.end_time_ms < span.start_time_ms {
        return Err("end_time_ms precedes start_time_ms".into());
    }
    if let Some(message) = &span.status_message {
        if message.len() > MAX_STATUS_MESSAGE_LEN {
            return Err(format!(
                "status_message exceeds {} chars",
                MAX_STATUS_MESSAGE_LEN
            ));
        }
    }
    if span.attributes.len() > MAX_ATTRIBUTES_PER_SPAN {
        return Err(format!(
            "more than {} attributes",
            MAX_ATTRIBUTES_PER_SPAN
        ));
    }
    if span.attribute_bytes() > MAX_ATTRIBUTE_BYTES {
        return Err(format!(
            "attributes exceed {} serialized bytes",
            MAX_ATTRIBUTE_BYTES
        ));
    }
    if span.events.len() > MAX_EVENTS_PER_SPAN {
        return Err(format!("more than {} events", MAX_EVENTS_PER_SPAN));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use sidechain_telemetry::{SpanEventRecord, SpanStatus};
    use std::collections::BTreeMap;

    fn valid_span() -> SpanRecord {
        SpanRecord {
            trace_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            span_id: "1111111111111111".parse().unwrap(),
            parent_span_id: None,
            name: "plugin.upload_audio".into(),
            start_time_ms: 1_000,
            end_time_ms: 4_000,
            status: SpanStatus::Ok,
            status_message: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    fn envelope_with(spans: Vec<SpanRecord>) -> BatchEnvelope {
        BatchEnvelope {
            sent_at: 1_700_000_000_000,
            client_kind: ClientKind::Plugin,
            client_version: "1.2.0".into(),
            spans,
        }
    }

    #[test]
    fn valid_envelope_passes() {
        assert!(validate_envelope(&envelope_with(vec![valid_span()])).is_ok());
    }

    #[test]
    fn empty_envelope_rejected() {
        let err = validate_envelope(&envelope_with(vec![])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvariantViolation);
    }

    #[test]
    fn negative_duration_rejected() {
        let mut span = valid_span();
        span.start_time_ms = 5_000;
        span.end_time_ms = 4_000;
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn self_parent_rejected() {
        let mut span = valid_span();
        span.parent_span_id = Some(span.span_id);
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn oversized_name_rejected() {
        let mut span = valid_span();
        span.name = "n".repeat(MAX_NAME_LEN + 1);
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn attribute_count_cap_enforced() {
        let mut span = valid_span();
        for i in 0..(MAX_ATTRIBUTES_PER_SPAN + 1) {
            span.attributes.insert(format!("k{}", i), (i as i64).into());
        }
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn attribute_byte_cap_enforced() {
        let mut span = valid_span();
        span.attributes
            .insert("blob".into(), "x".repeat(MAX_ATTRIBUTE_BYTES).into());
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn event_cap_enforced() {
        let mut span = valid_span();
        for i in 0..(MAX_EVENTS_PER_SPAN + 1) {
            span.events.push(SpanEventRecord {
                timestamp_ms: i as u64,
                name: "tick".into(),
                attributes: BTreeMap::new(),
            });
        }
        assert!(validate_envelope(&envelope_with(vec![span])).is_err());
    }

    #[test]
    fn server_kind_rejected_on_ingest() {
        let mut envelope = envelope_with(vec![valid_span()]);
        envelope.client_kind = ClientKind::Server;
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn one_bad_span_rejects_the_batch() {
        let mut bad = valid_span();
        bad.span_id = "2222222222222222".parse().unwrap();
        bad.end_time_ms = 0;
        bad.start_time_ms = 10;
        let err = validate_envelope(&envelope_with(vec![valid_span(), bad])).unwrap_err();
        assert!(err.message().starts_with("span 1:"));
    }
}
