//! Error handling for the Sidechain backend.
//!
//! Every failure surfaced over HTTP carries a stable machine-readable
//! `error_code` so clients can distinguish retryable from terminal failures
//! without parsing messages. The ingest exporter in particular keys its
//! drop-or-retry decision off these codes.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

/// A specialized Result type for backend operations.
pub type Result<T> = std::result::Result<T, SidechainError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes. Stable; clients branch on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Ingest validation
    MalformedPayload,
    PayloadTooLarge,
    InvariantViolation,

    // Auth
    Unauthenticated,
    Forbidden,
    ForbiddenTrace,

    // Throttling
    RateLimited,

    // Persistence / infrastructure
    UpstreamUnavailable,
    DatabaseError,
    CacheError,

    // Query surface
    RecordNotFound,

    // Startup
    ConfigurationError,

    Internal,
}

impl ErrorCode {
    /// HTTP status this code maps to.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::MalformedPayload => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvariantViolation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::ForbiddenTrace => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::RecordNotFound => StatusCode::NOT_FOUND,
            Self::DatabaseError
            | Self::CacheError
            | Self::ConfigurationError
            | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client should retry with backoff.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable | Self::RateLimited | Self::DatabaseError | Self::CacheError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The wire rendering, e.g. FORBIDDEN_TRACE.
        let s = serde_json::to_string(self).unwrap_or_default();
        f.write_str(s.trim_matches('"'))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The backend error type: a stable code, a client-safe message, and an
/// optional source chain for logs.
#[derive(Error, Debug)]
pub struct SidechainError {
    code: ErrorCode,
    message: Cow<'static, str>,
    /// Seconds the client should wait before retrying (rate limiting only).
    retry_after_secs: Option<u64>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SidechainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl SidechainError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_secs: None,
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn malformed_payload(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::MalformedPayload, message)
    }

    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("payload of {} bytes exceeds the {} byte limit", size, limit),
        )
    }

    pub fn invariant_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    pub fn unauthenticated(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn forbidden_trace(trace_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ForbiddenTrace,
            format!("trace {} belongs to another user", trace_id),
        )
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: "too many telemetry batches, slow down".into(),
            retry_after_secs: Some(retry_after_secs.max(1)),
            source: None,
        }
    }

    pub fn upstream_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message)
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity, id),
        )
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Log with severity matching the failure class.
    fn log(&self) {
        let status = self.http_status().as_u16();
        if status >= 500 {
            error!(error_code = %self.code, message = %self.message, source = ?self.source, "request failed");
        } else if status == 429 {
            debug!(error_code = %self.code, "rate limited");
        } else {
            warn!(error_code = %self.code, message = %self.message, "request rejected");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire Shape
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body: `{ "error_code": "...", "message": "..." }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: ErrorCode,
    pub message: String,
}

impl IntoResponse for SidechainError {
    fn into_response(self) -> Response {
        self.log();
        counter!(
            "sidechain_errors_total",
            "code" => self.code.to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);

        let body = ErrorBody {
            error_code: self.code,
            message: self.message.to_string(),
        };
        let mut response = (self.http_status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SidechainError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => {
                Self::new(ErrorCode::RecordNotFound, "record not found").with_source(error)
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::upstream_unavailable("span store unavailable").with_source(error)
            }
            _ => Self::new(ErrorCode::DatabaseError, "span store query failed").with_source(error),
        }
    }
}

impl From<redis::RedisError> for SidechainError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_connection_dropped() || error.is_timeout() {
            Self::upstream_unavailable("cache unavailable").with_source(error)
        } else {
            Self::new(ErrorCode::CacheError, "cache operation failed").with_source(error)
        }
    }
}

impl From<serde_json::Error> for SidechainError {
    fn from(error: serde_json::Error) -> Self {
        Self::malformed_payload("request body is not valid JSON").with_source(error)
    }
}

impl From<config::ConfigError> for SidechainError {
    fn from(error: config::ConfigError) -> Self {
        Self::new(ErrorCode::ConfigurationError, "configuration error").with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
