//! Ingest pipeline tests.
//!
//! These drive `IngestService::process` directly. The database pool is lazy
//! and points nowhere, which exercises exactly the guarantee the pipeline
//! makes: every rejection (size, schema, invariants, ownership, rate limit)
//! happens before storage, and storage failures surface as retryable 503s.

use sidechain_core::config::IngestConfig;
use sidechain_core::db::Database;
use sidechain_core::error::ErrorCode;
use sidechain_core::ingest::IngestService;
use sidechain_core::middleware::AuthContext;

fn caller(user_id: &str) -> AuthContext {
    AuthContext {
        user_id: user_id.to_string(),
        roles: Vec::new(),
    }
}

fn service(config: IngestConfig) -> std::sync::Arc<IngestService> {
    let db = Database::connect_lazy("postgres://nobody@127.0.0.1:1/void").unwrap();
    IngestService::new(db, &config)
}

fn envelope_json(trace_id: &str, span_id: &str) -> serde_json::Value {
    serde_json::json!({
        "sent_at": 1_700_000_000_000u64,
        "client_kind": "plugin",
        "client_version": "1.2.0",
        "spans": [{
            "trace_id": trace_id,
            "span_id": span_id,
            "name": "plugin.upload_audio",
            "start_time_ms": 1_000u64,
            "end_time_ms": 4_000u64,
            "status": "ok"
        }]
    })
}

fn body(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

#[tokio::test]
async fn malformed_payload_rejected() {
    let service = service(IngestConfig::default());
    let err = service
        .process(&caller("u1"), b"{not json")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedPayload);
}

#[tokio::test]
async fn size_cap_is_byte_exact() {
    let mut config = IngestConfig::default();
    config.max_batch_bytes = 512;
    let service = service(config);

    // Exactly at the cap: the size check passes and decoding takes over.
    let at_cap = vec![b'x'; 512];
    let err = service.process(&caller("u1"), &at_cap).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedPayload);

    // One byte above: hard reject before any decoding.
    let above_cap = vec![b'x'; 513];
    let err = service.process(&caller("u1"), &above_cap).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PayloadTooLarge);
}

#[tokio::test]
async fn invariant_violation_rejected() {
    let service = service(IngestConfig::default());
    let mut envelope = envelope_json("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "1111111111111111");
    envelope["spans"][0]["end_time_ms"] = serde_json::json!(500u64); // before start
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvariantViolation);
}

#[tokio::test]
async fn zero_trace_id_rejected_at_decode() {
    let service = service(IngestConfig::default());
    let envelope = envelope_json("00000000000000000000000000000000", "1111111111111111");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedPayload);
}

#[tokio::test]
async fn store_outage_is_retryable() {
    let service = service(IngestConfig::default());
    let envelope = envelope_json("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "1111111111111111");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn cross_user_trace_claim_refused() {
    let service = service(IngestConfig::default());
    let trace = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    // U1 establishes ownership (persist itself fails; ownership stands).
    let envelope = envelope_json(trace, "1111111111111111");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);

    // U2 claiming the same trace is refused with FORBIDDEN_TRACE.
    let envelope = envelope_json(trace, "2222222222222222");
    let err = service
        .process(&caller("u2"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ForbiddenTrace);

    // U1 remains the owner.
    let envelope = envelope_json(trace, "3333333333333333");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
}

#[tokio::test]
async fn rate_limit_applies_per_user() {
    let mut config = IngestConfig::default();
    config.rate_per_user_per_min = 2;
    config.rate_burst = 0;
    let service = service(config);

    for span_id in ["1111111111111111", "2222222222222222"] {
        let envelope = envelope_json("cccccccccccccccccccccccccccccccc", span_id);
        let err = service
            .process(&caller("u1"), &body(&envelope))
            .await
            .unwrap_err();
        // Past the limiter, into (failing) persistence.
        assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
    }

    let envelope = envelope_json("cccccccccccccccccccccccccccccccc", "3333333333333333");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimited);

    // Another user is unaffected.
    let envelope = envelope_json("dddddddddddddddddddddddddddddddd", "4444444444444444");
    let err = service
        .process(&caller("u2"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
}

#[tokio::test]
async fn validation_happens_before_rate_limiting() {
    let mut config = IngestConfig::default();
    config.rate_per_user_per_min = 1;
    config.rate_burst = 0;
    let service = service(config);

    // Malformed batches never consume rate budget.
    for _ in 0..5 {
        let err = service
            .process(&caller("u1"), b"broken")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
    }

    let envelope = envelope_json("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee", "1111111111111111");
    let err = service
        .process(&caller("u1"), &body(&envelope))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
}
