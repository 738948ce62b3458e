pub mod collections;
pub mod contents;
pub mod messages;
pub mod processings;
pub mod requests;
pub mod transforms;

use anyhow::Result;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use stagehand_core::config::DatabaseConfig;

/// Create the shared connection pool and apply schema migrations.
///
/// Repository functions take an explicit `&mut PgConnection`: read paths
/// acquire a pooled connection, write paths run inside a transaction owned by
/// the outermost caller, which alone commits or rolls back.
pub async fn initialize_pool(config: &DatabaseConfig) -> Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(false) // Skip pre-acquire health check for lower latency
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Set session-level timeouts to prevent runaway queries and idle transactions
                sqlx::query("SET statement_timeout = '30s'")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("SET idle_in_transaction_session_timeout = '60s'")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
