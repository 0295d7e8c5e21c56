mod backends;
mod bootstrap;
mod health;

use anyhow::Result;
use tokio::sync::watch;
use triago_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use triago_core::config::LogFormat;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(log_level);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.store.clone(), app.resilience.clone()),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = app.poller;
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    tracing::info!(event_name = "system.server.started", "triago-server started");

    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "triago-server stopping");

    let _ = shutdown_tx.send(true);
    match poller_task.await {
        Ok(result) => result?,
        Err(error) => tracing::warn!(error = %error, "mail poller task ended abnormally"),
    }

    tracing::info!(event_name = "system.server.stopped", "triago-server stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
