//! Trace context propagation over HTTP headers.
//!
//! The carrier is abstracted behind an `Injector`/`Extractor` trait pair so
//! the same logic serves reqwest header maps on clients and axum header maps
//! on the server. Header names are canonical on emit; extraction relies on
//! the carrier's case-insensitive lookup (HTTP header maps provide this).

use std::str::FromStr;

use crate::context::{ClientKind, SpanId, TraceContext, TraceId, MAX_CLIENT_VERSION_LEN};

/// Request + response: 32 lowercase hex chars.
pub const HEADER_TRACE_ID: &str = "X-Trace-ID";
/// Request + response: 16 lowercase hex chars.
pub const HEADER_SPAN_ID: &str = "X-Span-ID";
/// Request only; omitted on root spans.
pub const HEADER_PARENT_SPAN_ID: &str = "X-Parent-Span-ID";
/// Request only: `plugin`, `web`, or `cli`.
pub const HEADER_CLIENT_KIND: &str = "X-Client-Kind";
/// Request only: free-form version string.
pub const HEADER_CLIENT_VERSION: &str = "X-Client-Version";
/// Request only: unsigned decimal ms since epoch.
pub const HEADER_CLIENT_TIMESTAMP: &str = "X-Client-Timestamp";
/// Response only: server processing time, unsigned decimal ms.
pub const HEADER_SERVER_TIME_MS: &str = "X-Server-Time-Ms";
/// Request only: `k=v` pairs, comma-joined, printable ASCII.
pub const HEADER_BAGGAGE: &str = "X-Baggage";

/// Write-side carrier for header propagation.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Read-side carrier. `get` must be case-insensitive on the key, as HTTP
/// header maps are.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl Injector for std::collections::HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_ascii_lowercase(), value);
    }
}

impl Extractor for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        std::collections::HashMap::get(self, &key.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

impl Injector for reqwest::header::HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(&value),
        ) {
            self.insert(name, value);
        }
    }
}

impl Extractor for reqwest::header::HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        reqwest::header::HeaderMap::get(self, key).and_then(|v| v.to_str().ok())
    }
}

fn is_printable_ascii(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

fn baggage_entry_ok(key: &str, value: &str) -> bool {
    is_printable_ascii(key)
        && is_printable_ascii(value)
        && !key.contains('=')
        && !key.contains(',')
        && !value.contains(',')
}

/// Render context headers for an outgoing request carrying `span_id` as the
/// current span. The receiver will adopt `span_id` as its root's parent.
pub fn inject(ctx: &TraceContext, span_id: SpanId, now_ms: u64, carrier: &mut dyn Injector) {
    carrier.set(HEADER_TRACE_ID, ctx.trace_id.to_string());
    carrier.set(HEADER_SPAN_ID, span_id.to_string());
    if let Some(parent) = ctx.parent_span_id {
        carrier.set(HEADER_PARENT_SPAN_ID, parent.to_string());
    }
    carrier.set(HEADER_CLIENT_KIND, ctx.client_kind.to_string());
    carrier.set(HEADER_CLIENT_VERSION, ctx.client_version.clone());
    carrier.set(HEADER_CLIENT_TIMESTAMP, now_ms.to_string());

    let baggage: Vec<String> = ctx
        .baggage
        .iter()
        .filter(|(k, v)| baggage_entry_ok(k, v))
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    if !baggage.is_empty() {
        carrier.set(HEADER_BAGGAGE, baggage.join(","));
    }
}

/// Parse context headers from an incoming request.
///
/// Returns `None` when any of the required identity headers (`X-Trace-ID`,
/// `X-Span-ID`, `X-Client-Kind`, `X-Client-Version`) is missing or malformed;
/// the caller then mints a fresh trace. Never fails the request.
///
/// In the returned context, `parent_span_id` carries the sender's span id and
/// `span_id` is a freshly generated id for the receiving side.
pub fn extract(carrier: &dyn Extractor) -> Option<TraceContext> {
    let trace_id = TraceId::from_str(carrier.get(HEADER_TRACE_ID)?.trim()).ok()?;
    let incoming_span = SpanId::from_str(carrier.get(HEADER_SPAN_ID)?.trim()).ok()?;
    let client_kind = ClientKind::from_str(carrier.get(HEADER_CLIENT_KIND)?.trim()).ok()?;

    let client_version = carrier.get(HEADER_CLIENT_VERSION)?.trim();
    if client_version.is_empty()
        || client_version.len() > MAX_CLIENT_VERSION_LEN
        || !is_printable_ascii(client_version)
    {
        return None;
    }

    let baggage = carrier
        .get(HEADER_BAGGAGE)
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    baggage_entry_ok(k, v).then(|| (k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TraceContext {
        trace_id,
        span_id: SpanId::generate(),
        parent_span_id: Some(incoming_span),
        client_kind,
        client_version: client_version.to_string(),
        baggage,
    })
}

/// Parse the client timestamp header, if present and well-formed.
pub fn extract_client_timestamp(carrier: &dyn Extractor) -> Option<u64> {
    carrier
        .get(HEADER_CLIENT_TIMESTAMP)
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_ctx() -> TraceContext {
        TraceContext {
            trace_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            span_id: "1111111111111111".parse().unwrap(),
            parent_span_id: None,
            client_kind: ClientKind::Plugin,
            client_version: "1.2.0".to_string(),
            baggage: vec![("session_label".into(), "take-3".into())],
        }
    }

    #[test]
    fn inject_extract_round_trip() {
        let ctx = sample_ctx();
        let sid: SpanId = "2222222222222222".parse().unwrap();

        let mut headers = HashMap::new();
        inject(&ctx, sid, 1_700_000_000_000, &mut headers);

        let extracted = extract(&headers).unwrap();
        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.parent_span_id, Some(sid));
        assert_eq!(extracted.client_kind, ctx.client_kind);
        assert_eq!(extracted.client_version, ctx.client_version);
        assert_eq!(extracted.baggage, ctx.baggage);
        assert_eq!(extract_client_timestamp(&headers), Some(1_700_000_000_000));
    }

    #[test]
    fn extract_generates_fresh_receiver_span_id() {
        let ctx = sample_ctx();
        let mut headers = HashMap::new();
        inject(&ctx, ctx.span_id, 0, &mut headers);

        let a = extract(&headers).unwrap();
        let b = extract(&headers).unwrap();
        assert_ne!(a.span_id, b.span_id);
        assert_ne!(a.span_id, ctx.span_id);
    }

    #[test]
    fn malformed_trace_id_yields_none() {
        let ctx = sample_ctx();
        let mut headers = HashMap::new();
        inject(&ctx, ctx.span_id, 0, &mut headers);
        headers.set(HEADER_TRACE_ID, "not-hex".to_string());
        assert!(extract(&headers).is_none());
    }

    #[test]
    fn missing_required_headers_yield_none() {
        let ctx = sample_ctx();
        for dropped in [
            HEADER_TRACE_ID,
            HEADER_SPAN_ID,
            HEADER_CLIENT_KIND,
            HEADER_CLIENT_VERSION,
        ] {
            let mut headers = HashMap::new();
            inject(&ctx, ctx.span_id, 0, &mut headers);
            headers.remove(&dropped.to_ascii_lowercase());
            assert!(extract(&headers).is_none(), "dropped {}", dropped);
        }
    }

    #[test]
    fn missing_timestamp_does_not_block_extraction() {
        let ctx = sample_ctx();
        let mut headers = HashMap::new();
        inject(&ctx, ctx.span_id, 0, &mut headers);
        headers.remove(&HEADER_CLIENT_TIMESTAMP.to_ascii_lowercase());
        assert!(extract(&headers).is_some());
    }

    #[test]
    fn server_kind_is_not_a_client_kind_on_the_wire() {
        // The header contract only names plugin|web|cli, but extraction of
        // "server" stays well-formed for internal hops.
        let mut headers = HashMap::new();
        headers.set(HEADER_TRACE_ID, "a".repeat(32));
        headers.set(HEADER_SPAN_ID, "1".repeat(16));
        headers.set(HEADER_CLIENT_KIND, "toaster".to_string());
        headers.set(HEADER_CLIENT_VERSION, "1.0".to_string());
        assert!(extract(&headers).is_none());
    }

    #[test]
    fn non_ascii_baggage_dropped_both_ways() {
        let mut ctx = sample_ctx();
        ctx.baggage = vec![
            ("ok".into(), "yes".into()),
            ("bad\u{1f3b8}".into(), "v".into()),
            ("ctrl".into(), "a\x07b".into()),
        ];
        let mut headers = HashMap::new();
        inject(&ctx, ctx.span_id, 0, &mut headers);
        assert_eq!(
            headers.get(&HEADER_BAGGAGE.to_ascii_lowercase()),
            Some(&"ok=yes".to_string())
        );

        // And on extract, a hostile carrier entry is dropped silently.
        headers.set(HEADER_BAGGAGE, "ok=yes,broken,\u{00e9}=v".to_string());
        let extracted = extract(&headers).unwrap();
        assert_eq!(extracted.baggage, vec![("ok".to_string(), "yes".to_string())]);
    }

    #[test]
    fn canonical_header_names_are_exact() {
        assert_eq!(HEADER_TRACE_ID, "X-Trace-ID");
        assert_eq!(HEADER_SPAN_ID, "X-Span-ID");
        assert_eq!(HEADER_PARENT_SPAN_ID, "X-Parent-Span-ID");
        assert_eq!(HEADER_SERVER_TIME_MS, "X-Server-Time-Ms");
    }
}
