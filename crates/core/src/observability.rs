//! Tracing bootstrap for agent binaries.

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer, Registry as TracingRegistry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initialize the tracing subscriber for a service.
///
/// Log format is controlled by `LOG_FORMAT`: JSON for structured logging in
/// production (the default), human-readable for development.
pub fn init_tracing(service_name: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("failed to initialize tracing filter layer");

    let use_json = std::env::var("LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_lowercase()
        == "json";

    let format_layer = if use_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    TracingRegistry::default()
        .with(env_filter)
        .with(format_layer)
        .try_init()?;

    tracing::info!("Tracing initialized for {}", service_name);
    Ok(())
}
