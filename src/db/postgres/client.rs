use std::time::Duration;

use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::{info, warn};
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

const CONNECT_ATTEMPTS: u32 = 3;

/// Pooled PostgreSQL client.
///
/// Holds every table the core writes: blocks, transactions, decoded
/// messages, events and the per-stage checkpoints.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
}

impl PostgresClient {
    /// Build the pool and verify it with a real connection, retrying with
    /// backoff so a database that is still starting up does not kill the
    /// process.
    pub async fn new(settings: PostgresSettings) -> anyhow::Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .password(&settings.password)
            .dbname(&settings.database);

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size)
            .build()
            .context("Failed to create PostgreSQL connection pool")?;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match pool.get().await {
                Ok(_) => {
                    info!(
                        "Connected to PostgreSQL at {}:{}/{}",
                        settings.host, settings.port, settings.database
                    );
                    return Ok(Self { pool });
                },
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    let delay = Duration::from_millis(200 * 2_u64.pow(attempt - 1));
                    warn!(
                        "PostgreSQL not ready (attempt {}/{}): {}; retrying in {:?}",
                        attempt, CONNECT_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    return Err(anyhow::Error::from(e)).with_context(|| {
                        format!("Failed to reach PostgreSQL after {} attempts", CONNECT_ATTEMPTS)
                    });
                },
            }
        }

        unreachable!("connect loop always returns")
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .context("PostgreSQL health check failed")?;
        Ok(())
    }

    /// Apply `schema/postgres.sql`. Every statement is idempotent
    /// (`IF NOT EXISTS`), so running this on every startup is safe.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("Running PostgreSQL migrations");
        let client = self.pool.get().await?;

        let schema = tokio::fs::read_to_string("schema/postgres.sql")
            .await
            .context("Failed to read schema/postgres.sql")?;

        for stmt in schema.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            client
                .execute(stmt, &[])
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!("PostgreSQL migrations completed");
        Ok(())
    }
}
