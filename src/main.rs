use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use zerofeed::config::{Config, ConfigProvider, FileConfigProvider, StaticConfigProvider};
use zerofeed::controller::ZeroExportController;
use zerofeed::devices::build_collaborators;
use zerofeed::telemetry::{BroadcastPublisher, NullPublisher, TelemetryPublisher, log_events};

#[tokio::main]
async fn main() -> Result<()> {
    let explicit = std::env::args().nth(1);
    let (config, path) = Config::load(explicit.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    zerofeed::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Zerofeed {} starting up ({} inverter(s), config: {})",
        env!("CARGO_PKG_VERSION"),
        config.inverters.len(),
        path.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string())
    );

    let collaborators = build_collaborators(&config)
        .map_err(|e| anyhow::anyhow!("Failed to set up devices: {}", e))?;

    let provider: Box<dyn ConfigProvider> = match &path {
        Some(p) => Box::new(FileConfigProvider::new(p, &config)),
        None => Box::new(StaticConfigProvider::from_config(&config)),
    };

    let telemetry: Arc<dyn TelemetryPublisher> = if config.telemetry.enabled {
        let publisher = BroadcastPublisher::new(config.telemetry.channel_capacity);
        tokio::spawn(log_events(publisher.subscribe()));
        Arc::new(publisher)
    } else {
        Arc::new(NullPublisher)
    };

    let mut controller = ZeroExportController::builder(config)
        .collaborators(collaborators)
        .provider(provider)
        .telemetry(telemetry)
        .build()
        .context("Failed to build controller")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current iteration");
            let _ = shutdown_tx.send(true);
        }
    });

    match controller.run(shutdown_rx).await {
        Ok(()) => {
            info!("Zerofeed shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Controller failed with error: {}", e);
            Err(anyhow::anyhow!("Controller error: {}", e))
        }
    }
}
