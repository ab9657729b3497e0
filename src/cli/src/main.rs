//! Sidechain CLI - Command-line client for the Sidechain platform.
//!
//! Provides trace inspection, health, and configuration commands. Every
//! command runs inside its own trace: the CLI records spans locally, ships
//! them to the telemetry ingest endpoint, and blocks for up to two seconds on
//! flush before exiting.

mod client;
mod commands;
mod output;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sidechain_telemetry::{
    ClientKind, SpanRecorder, SpanStatus, TelemetryConfig, TraceContext,
};

use commands::{config, health, trace};
use output::OutputFormat;

/// How long the exiting process waits for the exporter to drain.
const EXIT_FLUSH_DEADLINE: Duration = Duration::from_secs(2);

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Sidechain - social music production platform CLI
#[derive(Parser)]
#[command(
    name = "sidechain",
    version = env!("CARGO_PKG_VERSION"),
    about = "Sidechain platform CLI",
    long_about = "CLI client for the Sidechain platform: trace inspection, health checks, and configuration.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "SIDECHAIN_API_URL")]
    api_url: Option<String>,

    /// Bearer token for authenticated endpoints
    #[arg(long, global = true, env = "SIDECHAIN_TOKEN")]
    token: Option<String>,

    /// Disable span recording for this invocation
    #[arg(long, global = true, env = "SIDECHAIN_NO_TELEMETRY")]
    no_telemetry: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect distributed traces
    #[command(subcommand)]
    Trace(trace::TraceCommands),

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

impl Commands {
    fn span_name(&self) -> &'static str {
        match self {
            Commands::Trace(_) => "cli.trace",
            Commands::Health(_) => "cli.health",
            Commands::Config(_) => "cli.config",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value("api-url"))
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let token = cli.token.clone().or_else(|| config::load_value("token"));

    let mut telemetry = TelemetryConfig::new(
        ClientKind::Cli,
        env!("CARGO_PKG_VERSION"),
        format!(
            "{}/api/v1/telemetry/spans",
            api_url.trim_end_matches('/')
        ),
    );
    if let Some(token) = &token {
        telemetry = telemetry.with_auth_token(token.clone());
    }
    if let Some(rate) = env_parse::<f64>("SAMPLER_RATE") {
        telemetry = telemetry.with_sampler_rate(rate);
    }
    if let Some(size) = env_parse::<usize>("EXPORT_BATCH_SIZE") {
        telemetry.export_batch_size = size;
    }
    if let Some(interval) = env_parse::<u64>("EXPORT_INTERVAL_MS") {
        telemetry.export_interval_ms = interval;
    }
    let tracing_enabled = env_parse::<bool>("TRACING_ENABLED").unwrap_or(true);
    if cli.no_telemetry || !tracing_enabled || token.is_none() {
        // Without a credential the ingest endpoint would reject every batch.
        telemetry = telemetry.disabled();
    }
    let recorder = SpanRecorder::new(telemetry);

    let ctx = TraceContext::new(ClientKind::Cli, env!("CARGO_PKG_VERSION"));
    let root = recorder.start(cli.command.span_name(), &ctx, None);

    let api = client::ApiClient::new(&api_url, token.as_deref(), recorder.clone(), ctx.clone())?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Trace(cmd) => trace::execute(cmd, &api, format).await,
        Commands::Health(args) => health::execute(args, &api, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    match &result {
        Ok(()) => recorder.end(root, SpanStatus::Ok, None),
        Err(e) => recorder.end(root, SpanStatus::Error, Some(&e.to_string())),
    }

    recorder.flush(EXIT_FLUSH_DEADLINE).await;

    if let Err(e) = result {
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
    Ok(())
}
