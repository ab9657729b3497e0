//! Configuration management.

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Telemetry ingest configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Auth configuration
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint for server spans
    pub otlp_endpoint: Option<String>,

    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON structured logs
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// If false, all span recording becomes a no-op
    #[serde(default = "default_tracing_enabled")]
    pub tracing_enabled: bool,

    /// Head-based sampling probability, decided at root span creation
    #[serde(default = "default_sampler_rate")]
    pub sampler_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            tracing_enabled: default_tracing_enabled(),
            sampler_rate: default_sampler_rate(),
        }
    }
}

/// Bounds and policies for the client span ingest pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Hard reject for envelopes above this many bytes
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Token bucket refill, batches per user per minute
    #[serde(default = "default_rate_per_user_per_min")]
    pub rate_per_user_per_min: u64,

    /// Extra bucket headroom accumulated while a user is idle
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u64,

    /// Days to keep client spans before pruning
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between retention sweeps
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,

    /// Rows deleted per retention batch
    #[serde(default = "default_retention_delete_batch")]
    pub retention_delete_batch: u32,

    /// Trace ownership cache entries per shard
    #[serde(default = "default_ownership_entries_per_shard")]
    pub ownership_entries_per_shard: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: default_max_batch_bytes(),
            rate_per_user_per_min: default_rate_per_user_per_min(),
            rate_burst: default_rate_burst(),
            retention_days: default_retention_days(),
            retention_sweep_secs: default_retention_sweep_secs(),
            retention_delete_batch: default_retention_delete_batch(),
            ownership_entries_per_shard: default_ownership_entries_per_shard(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for bearer token validation
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Check the Redis revocation set on every request
    #[serde(default)]
    pub check_revocation: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            check_revocation: false,
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logging() -> bool {
    true
}

fn default_tracing_enabled() -> bool {
    true
}

fn default_sampler_rate() -> f64 {
    1.0
}

fn default_max_batch_bytes() -> usize {
    1_048_576
}

fn default_rate_per_user_per_min() -> u64 {
    100
}

fn default_rate_burst() -> u64 {
    20
}

fn default_retention_days() -> u32 {
    7
}

fn default_retention_sweep_secs() -> u64 {
    300
}

fn default_retention_delete_batch() -> u32 {
    1_000
}

fn default_ownership_entries_per_shard() -> usize {
    4_096
}

fn default_jwt_secret() -> String {
    "change-me".to_string()
}

impl Config {
    /// Load configuration from `sidechain.toml` (optional) plus the
    /// environment. `SIDECHAIN_*` variables override file values; the plain
    /// deployment keys (`TRACING_ENABLED`, `SAMPLER_RATE`, and friends) are
    /// applied last.
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name("sidechain").required(false))
            .add_source(
                config::Environment::with_prefix("SIDECHAIN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<bool>("TRACING_ENABLED") {
            self.observability.tracing_enabled = v;
        }
        if let Some(v) = env_parse::<f64>("SAMPLER_RATE") {
            self.observability.sampler_rate = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<usize>("INGEST_MAX_BATCH_BYTES") {
            self.ingest.max_batch_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("INGEST_RATE_PER_USER_PER_MIN") {
            self.ingest.rate_per_user_per_min = v;
        }
        if let Some(v) = env_parse::<u32>("RETENTION_DAYS") {
            self.ingest.retention_days = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
