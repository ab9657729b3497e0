//! # Sidechain Core
//!
//! Backend for the Sidechain platform's distributed tracing subsystem.
//!
//! ## Architecture
//!
//! - **Middleware**: request tracing (context adoption, response echo) and
//!   bearer authentication as tower layers
//! - **Instrument**: span helpers for database, cache, and business events
//! - **Ingest**: the client span pipeline — validate, authorize, mask,
//!   rate-limit, persist
//! - **Db**: span storage plus the `unified_spans` query surface
//! - **Retention**: batched pruning of aged client spans
//! - **Observability**: JSON logging and OTLP export of server spans

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod instrument;
pub mod middleware;
pub mod observability;
pub mod retention;

pub use error::{ErrorCode, Result, SidechainError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::cache::Cache;
    pub use crate::config::Config;
    pub use crate::db::spans::UnifiedSpan;
    pub use crate::db::Database;
    pub use crate::error::{ErrorCode, Result, SidechainError};
    pub use crate::ingest::IngestService;
    pub use crate::middleware::{AuthContext, AuthLayer, RequestTrace, TraceLayer};
}
