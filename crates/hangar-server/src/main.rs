//! Hangar build scheduler daemon

use hangar_config::{SystemConfig, load_system_config};
use hangar_executor::ShellLauncher;
use hangar_scheduler::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("HANGAR_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config_path = PathBuf::from(
        std::env::var("HANGAR_CONFIG").unwrap_or_else(|_| "hangar.kdl".to_string()),
    );
    let config = if config_path.exists() {
        info!(path = %config_path.display(), "Loading configuration");
        load_system_config(&config_path)?
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        SystemConfig::default()
    };

    let launcher = Arc::new(ShellLauncher::new(&config.workspace));
    let engine = Engine::builder(config, launcher).build();
    engine.start().await?;
    info!(
        controller = %engine.config().controller.name,
        jobs = engine.config().jobs.len(),
        "Hangar is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.shutdown().await?;

    Ok(())
}
