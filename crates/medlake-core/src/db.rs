use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::retry::{with_retry, RetryPolicy};

pub type DbPool = Pool<Postgres>;

/// Establish a Postgres connection pool, retrying while the server is
/// unreachable.
pub async fn connect(config: &DatabaseConfig, retry: &RetryPolicy) -> Result<DbPool> {
    let url = config.connection_url();
    let pool = with_retry(retry, "connect_postgres", || async {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&url)
            .await
            .map_err(PipelineError::from)
    })
    .await?;

    tracing::info!(
        host = %config.host,
        database = %config.name,
        "database connection pool established"
    );
    Ok(pool)
}

pub async fn connect_url(database_url: &str) -> Result<DbPool> {
    let config = DatabaseConfig {
        url: Some(database_url.to_string()),
        ..DatabaseConfig::default()
    };
    connect(&config, &RetryPolicy::default()).await
}

/// Apply the embedded migrations. Safe to call on every run.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
