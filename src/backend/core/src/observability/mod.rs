//! Observability bootstrap: structured logging and server span export.
//!
//! Server spans are `tracing` spans bridged to OpenTelemetry and shipped over
//! OTLP to the collector, which writes the `server_spans` table consumed by
//! the unified view. Logs are JSON; the request middleware stamps `trace_id`
//! and `span_id` fields on its span so every log line in request scope is
//! correlated.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Sampler;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match (&config.otlp_endpoint, config.tracing_enabled) {
        (Some(endpoint), true) => {
            let sampler = if config.sampler_rate >= 1.0 {
                Sampler::AlwaysOn
            } else {
                // Head sampling: the decision is made for the trace id and
                // inherited by every child span.
                Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.sampler_rate)))
            };

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_sampler(sampler)
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new(
                                "service.name",
                                service_name.to_string(),
                            ),
                            opentelemetry::KeyValue::new(
                                "service.version",
                                env!("CARGO_PKG_VERSION").to_string(),
                            ),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;

            let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            if config.json_logging {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(telemetry_layer)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(telemetry_layer)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
        }
        _ => {
            if config.json_logging {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
        }
    }

    Ok(())
}

/// Flush and shut down the OTLP exporter.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
