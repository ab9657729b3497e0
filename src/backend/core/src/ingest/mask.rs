//! Sensitive attribute masking.
//!
//! Masking is total: a matching entry is removed outright, never redacted in
//! place, so downstream storage has no chance of retaining the value. The
//! rule is a case-insensitive substring match on the attribute key.

use sidechain_telemetry::SpanRecord;

/// Key fragments that mark an attribute as sensitive.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password", "token", "secret", "api_key", "auth", "cookie", "session",
];

/// Whether an attribute key must not be persisted.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

/// Drop sensitive attributes from a span and its events.
pub fn mask_span(span: &mut SpanRecord) -> usize {
    let mut removed = 0;

    let before = span.attributes.len();
    span.attributes.retain(|key, _| !is_sensitive_key(key));
    removed += before - span.attributes.len();

    for event in &mut span.events {
        let before = event.attributes.len();
        event.attributes.retain(|key, _| !is_sensitive_key(key));
        removed += before - event.attributes.len();
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidechain_telemetry::{SpanEventRecord, SpanStatus};
    use std::collections::BTreeMap;

    fn span_with_attrs(attrs: &[(&str, &str)]) -> SpanRecord {
        SpanRecord {
            trace_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            span_id: "1111111111111111".parse().unwrap(),
            parent_span_id: None,
            name: "plugin.upload_audio".into(),
            start_time_ms: 0,
            end_time_ms: 1,
            status: SpanStatus::Ok,
            status_message: None,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), (*v).into()))
                .collect(),
            events: Vec::new(),
        }
    }

    #[test]
    fn matching_keys_removed_entirely() {
        let mut span = span_with_attrs(&[("api_key", "XYZ"), ("foo", "bar")]);
        assert_eq!(mask_span(&mut span), 1);
        assert!(!span.attributes.contains_key("api_key"));
        assert_eq!(span.attributes.len(), 1);
        assert!(span.attributes.contains_key("foo"));
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        for key in [
            "Password",
            "user_PASSWORD_hash",
            "AuthHeader",
            "my_Session_id",
            "x-Cookie-jar",
            "client_Secret",
            "TOKEN_count",
        ] {
            assert!(is_sensitive_key(key), "{} should be sensitive", key);
        }
        for key in ["foo", "audio.sample_rate", "user.id", "http.route"] {
            assert!(!is_sensitive_key(key), "{} should be kept", key);
        }
    }

    #[test]
    fn event_attributes_masked_too() {
        let mut span = span_with_attrs(&[]);
        let mut attrs = BTreeMap::new();
        attrs.insert("session_token".to_string(), "abc".into());
        attrs.insert("step".to_string(), "upload".into());
        span.events.push(SpanEventRecord {
            timestamp_ms: 1,
            name: "auth.refreshed".into(),
            attributes: attrs,
        });

        assert_eq!(mask_span(&mut span), 1);
        assert_eq!(span.events[0].attributes.len(), 1);
        assert!(span.events[0].attributes.contains_key("step"));
    }
}
