//! Shared agent run loop.
//!
//! An agent is a periodic tick over a claimed batch of rows. Any number of
//! agent processes may run against the same database; correctness comes from
//! the claim transactions, not from anything in this loop.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

/// Run the agent tick loop with graceful shutdown support.
///
/// A failed tick is logged and the loop continues; per-row error handling
/// happens inside the tick itself.
pub async fn run_agent<F, Fut>(service_name: &str, poll_interval: Duration, tick: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(
        "Agent {} started, ticking every {:?}",
        service_name, poll_interval
    );

    let mut interval = interval(poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    error!("Agent {} tick failed: {:#}", service_name, e);
                }
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping agent {}", service_name);
                break;
            }
        }
    }

    Ok(())
}

/// Wait for shutdown signals (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
