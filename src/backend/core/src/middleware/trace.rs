//! Request tracing middleware.
//!
//! Every incoming request gets a root server span named `<METHOD> <route>`
//! (route template, not the instantiated path, to cap name cardinality). If
//! the request carries a valid trace context the server span adopts that
//! trace id and records the incoming client span as its parent; otherwise a
//! fresh trace is minted. Malformed context headers never fail the request.
//!
//! The response always echoes `X-Trace-ID`, the server root `X-Span-ID`, and
//! `X-Server-Time-Ms`, including on error responses, so clients can
//! reconstruct network latency.

use axum::{
    body::Body,
    extract::{FromRequestParts, MatchedPath, Request},
    http::{request::Parts, HeaderMap, HeaderValue},
    response::Response,
};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument};

use sidechain_telemetry::propagation::{
    self, Extractor, HEADER_SERVER_TIME_MS, HEADER_SPAN_ID, HEADER_TRACE_ID,
};
use sidechain_telemetry::{ClientKind, SpanId, TraceContext, TraceId};

/// Paths that never produce spans (scrape and probe noise).
const EXCLUDED_PATHS: &[&str] = &["/health", "/metrics"];

/// Request-scoped trace identity, carried in request extensions and passed to
/// collaborators explicitly. Never stored in a thread-local: requests migrate
/// between workers.
#[derive(Debug, Clone)]
pub struct RequestTrace {
    pub trace_id: TraceId,
    /// The server root span for this request.
    pub span_id: SpanId,
    /// The client span that caused this request, when propagated.
    pub parent_span_id: Option<SpanId>,
    pub client_kind: Option<ClientKind>,
    pub client_version: Option<String>,
    pub client_timestamp_ms: Option<u64>,
}

impl RequestTrace {
    fn minted() -> Self {
        Self {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            client_kind: None,
            client_version: None,
            client_timestamp_ms: None,
        }
    }

    fn from_context(ctx: &TraceContext, client_timestamp_ms: Option<u64>) -> Self {
        Self {
            trace_id: ctx.trace_id,
            span_id: ctx.span_id,
            parent_span_id: ctx.parent_span_id,
            client_kind: Some(ctx.client_kind),
            client_version: Some(ctx.client_version.clone()),
            client_timestamp_ms,
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestTrace
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestTrace>()
            .cloned()
            .unwrap_or_else(RequestTrace::minted))
    }
}

struct AxumHeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for AxumHeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }
}

/// Tracing layer for the router.
#[derive(Clone, Default)]
pub struct TraceLayer {
    _private: Arc<()>,
}

impl TraceLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService { inner }
    }
}

/// Tracing service.
#[derive(Clone)]
pub struct TraceService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TraceService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if EXCLUDED_PATHS.iter().any(|p| path == *p) {
                return inner.call(request).await;
            }

            let start = Instant::now();
            let method = request.method().to_string();
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| path.clone());

            // Adopt the caller's context when the headers parse; otherwise
            // mint a fresh trace. A malformed X-Trace-ID never rejects.
            let extractor = AxumHeaderExtractor(request.headers());
            let trace = match propagation::extract(&extractor) {
                Some(ctx) => {
                    let ts = propagation::extract_client_timestamp(&extractor);
                    RequestTrace::from_context(&ctx, ts)
                }
                None => RequestTrace::minted(),
            };

            let span_name = format!("{} {}", method, route);
            let span = info_span!(
                "http_request",
                otel.name = %span_name,
                otel.kind = "server",
                trace_id = %trace.trace_id,
                span_id = %trace.span_id,
                http.method = %method,
                http.route = %route,
                http.status = field::Empty,
                user.id = field::Empty,
                client.kind = trace
                    .client_kind
                    .map(|k| k.as_str())
                    .unwrap_or("unknown"),
                client.version = trace.client_version.as_deref().unwrap_or("unknown"),
                otel.status_code = field::Empty,
            );

            // Link the server span under the client's span so the exported
            // server trace shares the propagated trace id.
            if let Some(parent) = trace.parent_span_id {
                set_remote_parent(&span, trace.trace_id, parent);
            }

            request.extensions_mut().insert(trace.clone());

            let mut guard = CancelObserver::new(trace.trace_id);
            let result = inner.call(request).instrument(span.clone()).await;
            guard.completed();

            let elapsed_ms = start.elapsed().as_millis() as u64;
            match result {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    span.record("http.status", status);
                    span.record(
                        "otel.status_code",
                        if status >= 500 { "ERROR" } else { "OK" },
                    );

                    echo_trace_headers(response.headers_mut(), &trace, elapsed_ms);

                    counter!(
                        "http_requests_total",
                        "method" => method.clone(),
                        "route" => route.clone(),
                        "status" => status.to_string(),
                    )
                    .increment(1);
                    histogram!(
                        "http_request_duration_seconds",
                        "method" => method,
                        "route" => route,
                    )
                    .record(start.elapsed().as_secs_f64());

                    Ok(response)
                }
                Err(e) => {
                    span.record("otel.status_code", "ERROR");
                    Err(e)
                }
            }
        })
    }
}

/// Echo trace identity on a response. Also used by error paths so a client
/// can correlate failures.
pub fn echo_trace_headers(headers: &mut HeaderMap, trace: &RequestTrace, server_time_ms: u64) {
    if let Ok(value) = HeaderValue::from_str(&trace.trace_id.to_string()) {
        headers.insert(HEADER_TRACE_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&trace.span_id.to_string()) {
        headers.insert(HEADER_SPAN_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&server_time_ms.to_string()) {
        headers.insert(HEADER_SERVER_TIME_MS, value);
    }
}

/// Attach the propagated identity as the remote parent of the server span,
/// so OTLP export shares the client's trace id and parents the server root
/// under the client span.
fn set_remote_parent(span: &tracing::Span, trace_id: TraceId, parent_span_id: SpanId) {
    use opentelemetry::trace::{SpanContext, TraceContextExt, TraceFlags, TraceState};
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let remote = SpanContext::new(
        opentelemetry::trace::TraceId::from_bytes(trace_id.to_bytes()),
        opentelemetry::trace::SpanId::from_bytes(parent_span_id.to_bytes()),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    let cx = opentelemetry::Context::new().with_remote_span_context(remote);
    span.set_parent(cx);
}

/// Marks a request as cancelled if its future is dropped before completion
/// (client abort mid-flight).
struct CancelObserver {
    trace_id: TraceId,
    completed: bool,
}

impl CancelObserver {
    fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            completed: false,
        }
    }

    fn completed(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelObserver {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(trace_id = %self.trace_id, "request cancelled by client");
            counter!("http_requests_cancelled_total").increment(1);
        }
    }
}
