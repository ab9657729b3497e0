//! Database layer.
//!
//! PostgreSQL via sqlx. Telemetry span persistence and the unified query
//! surface live in [`spans`].

pub mod spans;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::Result;

/// Database connection and operations.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// A pool that connects on first use. Handlers that never touch the
    /// store (validation failures, auth failures) work without a database.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect_lazy(database_url)
            .map_err(crate::error::SidechainError::from)?;
        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                crate::error::SidechainError::internal("migration failed").with_source(e)
            })?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
