//! Trace inspection commands.
//!
//! `sidechain trace show <trace_id>` renders the unified client + server
//! span tree for one trace; `sidechain trace slow` lists the slowest traces.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum TraceCommands {
    /// Show every span of a trace, across all tiers
    Show {
        /// Trace id (32 hex chars)
        trace_id: String,
    },

    /// List traces whose slowest span exceeds a threshold (admin)
    Slow {
        /// Minimum span duration in milliseconds
        #[arg(long, default_value_t = 1_000)]
        min_duration_ms: u64,

        /// Maximum number of traces to list
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
}

/// One row of the unified span view, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
pub struct UnifiedSpanRow {
    #[tabled(rename = "SOURCE")]
    pub source: String,
    #[tabled(rename = "SPAN")]
    pub span_id: String,
    #[tabled(rename = "PARENT", display_with = "display_parent")]
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "START_MS")]
    pub start_time_ms: i64,
    #[tabled(rename = "DURATION_MS")]
    pub duration_ms: i64,
    #[tabled(rename = "STATUS")]
    pub status: String,
}

fn display_parent(parent: &Option<String>) -> String {
    parent.clone().unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Deserialize)]
struct TraceResponse {
    trace_id: String,
    spans: Vec<UnifiedSpanRow>,
}

#[derive(Debug, Deserialize)]
struct SlowTracesResponse {
    trace_ids: Vec<String>,
}

pub async fn execute(cmd: TraceCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        TraceCommands::Show { trace_id } => {
            let response: TraceResponse = client
                .get(&format!("/api/v1/telemetry/trace/{}", trace_id))
                .await?;

            if matches!(format, OutputFormat::Table) {
                output::print_header(&format!("Trace {}", response.trace_id));
                output::print_detail("Spans", &response.spans.len().to_string());
                println!();
            }
            output::print_list(&response.spans, format);
            Ok(())
        }

        TraceCommands::Slow {
            min_duration_ms,
            limit,
        } => {
            let response: SlowTracesResponse = client
                .get(&format!(
                    "/api/v1/telemetry/traces/slow?min_duration_ms={}&limit={}",
                    min_duration_ms, limit
                ))
                .await?;

            match format {
                OutputFormat::Table => {
                    if response.trace_ids.is_empty() {
                        output::print_success("No traces over the threshold");
                    } else {
                        output::print_header(&format!(
                            "Traces with spans over {} ms",
                            min_duration_ms
                        ));
                        for trace_id in &response.trace_ids {
                            println!("  {}", trace_id);
                        }
                    }
                }
                _ => output::print_item(&response.trace_ids, format),
            }
            Ok(())
        }
    }
}
