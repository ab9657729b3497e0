//! Recorder and exporter configuration.

use serde::Deserialize;

use crate::context::ClientKind;

/// Configuration for a client-side recorder + exporter pair.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// If false, the recorder becomes a no-op and nothing is exported.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Head-based sampling probability, decided at root span creation.
    #[serde(default = "default_sampler_rate")]
    pub sampler_rate: f64,

    /// Ingest endpoint, e.g. `https://api.sidechain.fm/api/v1/telemetry/spans`.
    pub endpoint: String,

    /// Bearer token presented to the ingest endpoint.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Flush once this many spans are buffered.
    #[serde(default = "default_export_batch_size")]
    pub export_batch_size: usize,

    /// Flush at least this often.
    #[serde(default = "default_export_interval_ms")]
    pub export_interval_ms: u64,

    /// Buffer cap; overflow drops the oldest spans.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Which tier this process is.
    pub client_kind: ClientKind,

    /// Version string stamped on every span.
    pub client_version: String,
}

impl TelemetryConfig {
    pub fn new(
        client_kind: ClientKind,
        client_version: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            enabled: default_enabled(),
            sampler_rate: default_sampler_rate(),
            endpoint: endpoint.into(),
            auth_token: None,
            export_batch_size: default_export_batch_size(),
            export_interval_ms: default_export_interval_ms(),
            buffer_capacity: default_buffer_capacity(),
            client_kind,
            client_version: client_version.into(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_sampler_rate(mut self, rate: f64) -> Self {
        self.sampler_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_enabled() -> bool {
    true
}

fn default_sampler_rate() -> f64 {
    1.0
}

fn default_export_batch_size() -> usize {
    256
}

fn default_export_interval_ms() -> u64 {
    5_000
}

fn default_buffer_capacity() -> usize {
    2_048
}
