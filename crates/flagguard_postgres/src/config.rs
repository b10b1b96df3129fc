//! Connection settings for the Postgres adapter.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl PgConfig {
    /// `FLAGGUARD_DATABASE_URL` (required), `FLAGGUARD_MAX_CONNECTIONS` (default 10).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url =
            lookup("FLAGGUARD_DATABASE_URL").context("FLAGGUARD_DATABASE_URL must be set")?;
        let max_connections = match lookup("FLAGGUARD_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLAGGUARD_MAX_CONNECTIONS '{raw}'"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        Ok(Self {
            database_url,
            max_connections,
        })
    }

    pub async fn connect(&self) -> Result<PgPool> {
        tracing::info!(max_connections = self.max_connections, "connecting to postgres");
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .context("failed to connect to postgres")
    }
}
