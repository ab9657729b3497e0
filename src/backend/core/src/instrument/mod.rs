//! Auto-instrumentation helpers.
//!
//! Handler authors never write tracing code: database access goes through
//! [`traced_db`], cache access through the instrumented facade in
//! [`crate::cache`], and domain operations open spans via [`business_span`]
//! with the stable names in [`events`]. All spans are children of the
//! ambient request span, so they inherit the request's trace identity.

use std::future::Future;
use std::time::Instant;

use tracing::{field, info_span, Instrument};

use crate::error::{ErrorCode, Result};

/// Stable business event span names. The operation that opens one of these
/// is responsible for ending it and attaching the attributes its event
/// schema calls for.
pub mod events {
    pub const FEED_CREATE_POST: &str = "feed.create_post";
    pub const FEED_RENDER: &str = "feed.render";
    pub const SOCIAL_FOLLOW_USER: &str = "social.follow_user";
    pub const SOCIAL_UNFOLLOW_USER: &str = "social.unfollow_user";
    pub const SEARCH_QUERY: &str = "search.query";
    pub const AUDIO_PROCESS: &str = "audio.process";
    pub const AUDIO_UPLOAD: &str = "audio.upload";
    pub const PLAYLIST_ADD_TRACK: &str = "playlist.add_track";
    pub const MESSAGE_SEND: &str = "message.send";
    pub const STORY_PUBLISH: &str = "story.publish";
    pub const CHALLENGE_SUBMIT: &str = "challenge.submit";
}

/// Run a database operation inside a `db.query` child span.
///
/// Records `db.operation`, `db.table`, and `db.duration_ms`. Statement text
/// is never recorded. The span status is error for any failure other than
/// "no rows".
pub async fn traced_db<T, F>(operation: &'static str, table: &'static str, f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let span = info_span!(
        "db.query",
        db.operation = operation,
        db.table = table,
        db.duration_ms = field::Empty,
        otel.status_code = field::Empty,
    );
    let start = Instant::now();
    let result = f.instrument(span.clone()).await;
    span.record("db.duration_ms", start.elapsed().as_millis() as u64);

    match &result {
        Err(e) if e.code() != ErrorCode::RecordNotFound => {
            span.record("otel.status_code", "ERROR");
        }
        _ => {
            span.record("otel.status_code", "OK");
        }
    }
    result
}

/// Open a span for a named domain operation. The caller ends it by dropping
/// the returned guard (or explicitly with `in_scope`).
pub fn business_span(name: &'static str) -> tracing::Span {
    info_span!(
        "business_event",
        otel.name = name,
        event.name = name,
        otel.status_code = field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SidechainError;

    #[tokio::test]
    async fn traced_db_passes_through_ok() {
        let result = traced_db("SELECT", "client_telemetry_spans", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn traced_db_passes_through_errors() {
        let result: Result<()> = traced_db("SELECT", "server_spans", async {
            Err(SidechainError::not_found("span", "x"))
        })
        .await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn business_span_enters_and_drops() {
        let span = business_span(events::FEED_CREATE_POST);
        let _entered = span.enter();
    }

    #[test]
    fn event_names_are_dot_delimited() {
        for name in [
            events::FEED_CREATE_POST,
            events::SOCIAL_FOLLOW_USER,
            events::SEARCH_QUERY,
            events::AUDIO_PROCESS,
        ] {
            assert!(name.contains('.'));
            assert!(name.len() <= 128);
        }
    }
}
