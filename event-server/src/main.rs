mod config;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use shared::messaging::EventServer;
use shared::observability::init_logging;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    config.validate()?;

    init_logging(config.log_config()?)?;

    info!("Starting Event Server...");

    let server = EventServer::bind(config.server_config()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    server.run(shutdown_rx).await?;

    info!("Event Server stopped");
    Ok(())
}
