//! Instrumented Redis cache facade.
//!
//! Every get/set produces a `cache.get` / `cache.set` child span with
//! `cache.key`, `cache.hit` (get only), and `cache.status`. Keys whose name
//! matches the sensitive-attribute rule are not recorded.

use std::time::Instant;

use redis::AsyncCommands;
use tracing::{field, info_span, Instrument};

use crate::error::Result;
use crate::ingest::mask::is_sensitive_key;

/// Redis-backed cache with span-per-operation instrumentation.
#[derive(Clone)]
pub struct Cache {
    conn: redis::aio::ConnectionManager,
}

impl Cache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    /// Fetch a value. Span status is `miss` for an absent key, `error` for a
    /// backend failure.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let span = info_span!(
            "cache.get",
            cache.key = recordable_key(key),
            cache.hit = field::Empty,
            cache.status = field::Empty,
            cache.duration_ms = field::Empty,
        );
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: std::result::Result<Option<String>, redis::RedisError> =
            async { conn.get(key).await }.instrument(span.clone()).await;
        span.record("cache.duration_ms", start.elapsed().as_millis() as u64);

        match result {
            Ok(Some(value)) => {
                span.record("cache.hit", true);
                span.record("cache.status", "success");
                Ok(Some(value))
            }
            Ok(None) => {
                span.record("cache.hit", false);
                span.record("cache.status", "miss");
                Ok(None)
            }
            Err(e) => {
                span.record("cache.hit", false);
                span.record("cache.status", "error");
                Err(e.into())
            }
        }
    }

    /// Store a value with a TTL.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let span = info_span!(
            "cache.set",
            cache.key = recordable_key(key),
            cache.status = field::Empty,
            cache.duration_ms = field::Empty,
        );
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: std::result::Result<(), redis::RedisError> =
            async { conn.set_ex(key, value, ttl_secs).await }
                .instrument(span.clone())
                .await;
        span.record("cache.duration_ms", start.elapsed().as_millis() as u64);

        match result {
            Ok(()) => {
                span.record("cache.status", "success");
                Ok(())
            }
            Err(e) => {
                span.record("cache.status", "error");
                Err(e.into())
            }
        }
    }
}

/// The key as recorded on the span, masked when its name is sensitive.
fn recordable_key(key: &str) -> &str {
    if is_sensitive_key(key) {
        "[masked]"
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_not_recorded() {
        assert_eq!(recordable_key("feed:user:42"), "feed:user:42");
        assert_eq!(recordable_key("session:abc123"), "[masked]");
        assert_eq!(recordable_key("oauth_token:xyz"), "[masked]");
    }
}
