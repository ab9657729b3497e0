//! Exporter behavior against a live HTTP endpoint.
//!
//! Covers batch shipment, retry with backoff, permanent rejection, the
//! drop-oldest overflow policy, and flush deadlines.

use std::collections::BTreeMap;
use std::time::Duration;

use sidechain_telemetry::{
    BatchEnvelope, ClientKind, SpanRecorder, SpanStatus, TelemetryConfig, TraceContext,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INGEST_PATH: &str = "/api/v1/telemetry/spans";

fn config_for(server: &MockServer) -> TelemetryConfig {
    TelemetryConfig::new(
        ClientKind::Cli,
        "0.1.0",
        format!("{}{}", server.uri(), INGEST_PATH),
    )
    .with_auth_token("test-token")
}

fn accepted_body(accepted: u64) -> serde_json::Value {
    serde_json::json!({ "accepted": accepted, "skipped_duplicates": 0 })
}

async fn received_envelopes(server: &MockServer) -> Vec<BatchEnvelope> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).expect("envelope body"))
        .collect()
}

#[tokio::test]
async fn root_end_flushes_a_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .and(wiremock::matchers::header(
            "authorization",
            "Bearer test-token",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(2)))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = SpanRecorder::new(config_for(&server));
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");

    let root = recorder.start("cli.command", &ctx, None);
    let child = recorder.start("http.request", &ctx, None);
    recorder.end(child, SpanStatus::Ok, None);
    recorder.end(root, SpanStatus::Ok, None);

    assert!(recorder.flush(Duration::from_secs(2)).await);

    let envelopes = received_envelopes(&server).await;
    assert_eq!(envelopes.len(), 1);
    let envelope = &envelopes[0];
    assert!(matches!(envelope.client_kind, ClientKind::Cli));
    assert_eq!(envelope.client_version, "0.1.0");
    assert_eq!(envelope.spans.len(), 2);
    assert!(envelope.spans.iter().all(|s| s.trace_id == ctx.trace_id));
    assert!(envelope.sent_at > 0);
}

#[tokio::test]
async fn server_error_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(1)))
        .mount(&server)
        .await;

    let recorder = SpanRecorder::new(config_for(&server));
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");
    let span = recorder.start("cli.command", &ctx, None);
    recorder.end(span, SpanStatus::Ok, None);

    // First attempt fails, backoff is ~1 s, second attempt succeeds.
    assert!(recorder.flush(Duration::from_secs(5)).await);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn client_error_drops_batch_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "error_code": "INVARIANT_VIOLATION",
            "message": "bad span"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = SpanRecorder::new(config_for(&server));
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");
    let span = recorder.start("cli.command", &ctx, None);
    recorder.end(span, SpanStatus::Ok, None);

    assert!(recorder.flush(Duration::from_secs(2)).await);
    // A second flush must not resend the rejected batch.
    assert!(recorder.flush(Duration::from_secs(2)).await);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn overflow_drops_oldest_and_reports_counter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(4)))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.buffer_capacity = 4;
    config.export_interval_ms = 60_000; // keep the timer out of the way
    let recorder = SpanRecorder::new(config);
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");

    let root = recorder.start("cli.command", &ctx, None);
    let mut children = Vec::new();
    for i in 0..6 {
        let child = recorder.start(format!("step.{i}"), &ctx, Some(root.span_id()));
        children.push(child);
    }
    for child in children {
        recorder.end(child, SpanStatus::Ok, None);
    }
    // Root stays open so nothing flushes before the buffer overflows.
    assert!(recorder.flush(Duration::from_secs(2)).await);

    let envelopes = received_envelopes(&server).await;
    assert_eq!(envelopes.len(), 1);
    let spans = &envelopes[0].spans;
    assert_eq!(spans.len(), 4);
    // The two oldest spans were discarded.
    assert!(spans.iter().all(|s| s.name != "step.0" && s.name != "step.1"));
    let reported = spans[0]
        .attributes
        .get("exporter.dropped_spans")
        .cloned()
        .expect("dropped counter attribute");
    assert_eq!(
        serde_json::to_value(&reported).unwrap(),
        serde_json::json!(2)
    );

    // Counter resets after the successful report.
    let tail = recorder.start("tail", &ctx, Some(root.span_id()));
    recorder.end(tail, SpanStatus::Ok, None);
    assert!(recorder.flush(Duration::from_secs(2)).await);
    let envelopes = received_envelopes(&server).await;
    let last = envelopes.last().unwrap();
    assert!(last.spans[0].attributes.get("exporter.dropped_spans").is_none());
}

#[tokio::test]
async fn flush_deadline_expires_on_stalled_ingest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let recorder = SpanRecorder::new(config_for(&server));
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");
    let span = recorder.start("cli.command", &ctx, None);
    recorder.end(span, SpanStatus::Ok, None);

    assert!(!recorder.flush(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn periodic_timer_flushes_without_root_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(1)))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.export_interval_ms = 100;
    let recorder = SpanRecorder::new(config);
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");

    let root = recorder.start("cli.command", &ctx, None);
    let child = recorder.start("http.request", &ctx, Some(root.span_id()));
    recorder.end(child, SpanStatus::Ok, None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!received_envelopes(&server).await.is_empty());
    let _ = root;
}

#[tokio::test]
async fn batch_size_trigger_flushes_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(8)))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.export_batch_size = 8;
    config.export_interval_ms = 60_000;
    let recorder = SpanRecorder::new(config);
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");

    let root = recorder.start("cli.command", &ctx, None);
    for i in 0..8 {
        let child = recorder.start(format!("step.{i}"), &ctx, Some(root.span_id()));
        recorder.end(child, SpanStatus::Ok, None);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let envelopes = received_envelopes(&server).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].spans.len(), 8);
    let _ = root;
}

#[tokio::test]
async fn span_attributes_survive_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body(1)))
        .mount(&server)
        .await;

    let recorder = SpanRecorder::new(config_for(&server));
    let ctx = TraceContext::new(ClientKind::Cli, "0.1.0");
    let span = recorder.start("search.query", &ctx, None);
    recorder.set_attribute(span, "search.terms", 3i64);
    recorder.set_attribute(span, "search.cached", false);
    recorder.record_event(
        span,
        "results.ranked",
        vec![("count".to_string(), 12i64.into())],
    );
    recorder.end(span, SpanStatus::Ok, None);
    assert!(recorder.flush(Duration::from_secs(2)).await);

    let envelopes = received_envelopes(&server).await;
    let span = &envelopes[0].spans[0];
    let attrs: BTreeMap<_, _> = span
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap()))
        .collect();
    assert_eq!(attrs["search.terms"], serde_json::json!(3));
    assert_eq!(attrs["search.cached"], serde_json::json!(false));
    assert_eq!(span.events.len(), 1);
    assert_eq!(span.events[0].name, "results.ranked");
}
