//! # Sidechain Telemetry
//!
//! Client-side distributed tracing for the Sidechain platform: trace context
//! propagation over HTTP, an in-process span recorder, and a batching
//! exporter that ships completed spans to the server ingest endpoint.
//!
//! The same crate is linked by the CLI, by the VST plugin's Rust core, and by
//! the backend (which reuses the context and wire types). The browser client
//! implements the identical wire contract in JS.
//!
//! ## Architecture
//!
//! - **Context**: `TraceId`/`SpanId` identity, `TraceContext` lifecycle
//! - **Propagation**: `X-Trace-ID` header family, inject/extract over a
//!   carrier trait pair so any header map can participate
//! - **Recorder**: flat span map, per-context parent stacks, head sampling
//! - **Exporter**: dedicated worker running an explicit state machine with
//!   bounded buffering, drop-oldest overflow, and jittered retry backoff
//! - **Ring**: lock-free SPSC ring for the plugin's real-time audio thread

pub mod config;
pub mod context;
pub mod export;
pub mod propagation;
pub mod recorder;
pub mod ring;
pub mod span;
pub mod time;

pub use config::TelemetryConfig;
pub use context::{ClientKind, SpanId, TraceContext, TraceId};
pub use export::{BatchEnvelope, ExporterHandle, IngestResponse};
pub use propagation::{extract, inject, Extractor, Injector};
pub use recorder::{SpanHandle, SpanRecorder};
pub use span::{AttributeValue, SpanEventRecord, SpanRecord, SpanStatus};
