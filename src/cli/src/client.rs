//! HTTP client for the Sidechain API.
//!
//! Every request runs inside an `http.request` child span and carries the
//! propagation headers, so server spans join the CLI's trace. The response
//! echo (`X-Server-Time-Ms`) is recorded on the span for latency analysis.

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::de::DeserializeOwned;

use sidechain_telemetry::propagation::{self, HEADER_SERVER_TIME_MS};
use sidechain_telemetry::time::now_unix_ms;
use sidechain_telemetry::{SpanRecorder, SpanStatus, TraceContext};

/// Error body returned by the API.
#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    error_code: String,
    message: String,
}

/// HTTP client carrying the command's trace context.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    recorder: SpanRecorder,
    ctx: TraceContext,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        recorder: SpanRecorder,
        ctx: TraceContext,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(|t| t.to_string()),
            recorder,
            ctx,
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a GET request and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let span = self.recorder.start("http.request", &self.ctx, None);
        self.recorder.set_attribute(span, "http.method", "GET");
        self.recorder.set_attribute(span, "http.url", url.as_str());

        let mut headers = HeaderMap::new();
        propagation::inject(&self.ctx, span.span_id(), now_unix_ms(), &mut headers);

        let mut request = self.client.get(&url).headers(headers);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.recorder
                    .end(span, SpanStatus::Error, Some(&e.to_string()));
                return Err(e).with_context(|| format!("GET {} failed", url));
            }
        };

        let status = response.status();
        self.recorder
            .set_attribute(span, "http.status", status.as_u16() as i64);
        if let Some(server_ms) = response
            .headers()
            .get(HEADER_SERVER_TIME_MS)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.recorder
                .set_attribute(span, "server.time_ms", server_ms);
        }

        if !status.is_success() {
            let message = match response.json::<ApiErrorBody>().await {
                Ok(body) => format!("{}: {}", body.error_code, body.message),
                Err(_) => format!("HTTP {}", status),
            };
            self.recorder
                .end(span, SpanStatus::Error, Some(&message));
            anyhow::bail!("API error: {}", message);
        }

        let parsed = response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse response from {}", url));
        match &parsed {
            Ok(_) => self.recorder.end(span, SpanStatus::Ok, None),
            Err(e) => self
                .recorder
                .end(span, SpanStatus::Error, Some(&e.to_string())),
        }
        parsed
    }
}
