//! Prediction Service - Main Entry Point
//!
//! Loads the model, starts the metrics exposition listener, then serves gRPC
//! until SIGINT/SIGTERM.

use anyhow::Result;
use prediction_service::config::{AppConfig, LoggingConfig};
use prediction_service::server::shutdown_signal;
use prediction_service::Application;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!("Starting Prediction Service");
    info!(
        model_version = %config.model.version,
        model_path = %config.model.path,
        rpc_addr = %config.rpc_addr(),
        metrics_addr = %config.metrics_addr(),
        workers = config.server.workers,
        "Configuration loaded"
    );

    // Missing or corrupt model: exit before any listener is started
    let app = match Application::build(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup aborted");
            return Err(e);
        }
    };

    app.bind().await?.serve(shutdown_signal()).await?;

    info!("Prediction Service stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level when set
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("prediction_service={}", logging.level).parse()?),
    };

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
