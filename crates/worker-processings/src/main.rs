use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;
use tracing::{error, warn};

use stagehand_core::agent::run_agent;
use stagehand_core::backoff::BackoffPolicy;
use stagehand_core::config::{AgentConfig, AppConfig};
use stagehand_core::observability::init_tracing;
use stagehand_orm::postgres::{initialize_pool, processings};

mod agent;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| "worker-processings".to_string());
    init_tracing(&service_name)?;

    // Load centralized configuration - fail fast if required config is missing
    let config = AppConfig::from_env()?;
    let agent_config = AgentConfig::from_env_with_prefix("PROCESSING_AGENT");
    let backoff = BackoffPolicy::from_env_with_prefix("PROCESSING_POLL");

    let pool = initialize_pool(&config.database).await?;

    // Stale-lock reaper: put rows claimed by crashed agents back into rotation.
    let reaper_pool = pool.clone();
    let lock_expire_secs = agent_config.lock_expire.as_secs() as i64;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            match reaper_pool.acquire().await {
                Ok(mut conn) => {
                    match processings::clean_locking(&mut conn, lock_expire_secs).await {
                        Ok(count) if count > 0 => {
                            warn!("Reset {} stale processing locks", count);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Stale processing lock cleanup failed: {}", e),
                    }
                }
                Err(e) => error!("Reaper could not acquire a connection: {}", e),
            }
        }
    });

    let context = Arc::new(agent::ProcessingAgentContext {
        pool,
        data_service: config.data_service,
        agent: agent_config.clone(),
        backoff,
    });

    run_agent(&service_name, agent_config.poll_interval, move || {
        let context = context.clone();
        async move { agent::tick(&context).await }
    })
    .await
}
