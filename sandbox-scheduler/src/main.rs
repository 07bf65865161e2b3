use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sandbox_scheduler::analysis::{AnalysisContext, ManagerRegistry};
use sandbox_scheduler::config::Config;
use sandbox_scheduler::queue::Scheduler;
use sandbox_scheduler::sandbox::{
    AuxiliaryRunner, BusConnector, CommandDriver, JsonReporter, MachinePool, NullRealtime,
    ResultRegistry, StaticRouting, TimeoutGuestFactory,
};
use sandbox_scheduler::storage::{FileDiaryStore, MemoryStore, TaskStore};
use shared::observability::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    init_logging(config.logging.log_config("sandbox-scheduler")?)?;

    info!("Starting Sandbox Scheduler...");
    info!("Configuration loaded successfully");

    // Task and machine inventory
    let store: Arc<dyn TaskStore> = match &config.machinery.seed_file {
        Some(path) => {
            let store = MemoryStore::from_file(path)
                .await
                .with_context(|| format!("Failed to load seed file {}", path.display()))?;
            info!(seed_file = %path.display(), "Loaded machines and tasks");
            Arc::new(store)
        }
        None => {
            warn!("No SEED_FILE configured, starting with an empty inventory");
            Arc::new(MemoryStore::new())
        }
    };

    let machinery = Arc::new(MachinePool::new(
        store.clone(),
        CommandDriver::new(config.machinery.command.clone()),
    ));

    // Result server guests report back to
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(ResultRegistry::new());
    let addr = config.machinery.result_server_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind result server on {}", addr))?;
    info!("Result server listening on {}", addr);
    let result_server = tokio::spawn(registry.clone().run(listener, shutdown_rx));

    let ctx = Arc::new(AnalysisContext {
        machinery,
        guests: Arc::new(TimeoutGuestFactory),
        routing: Arc::new(StaticRouting::new(
            config.analysis.default_route.clone(),
            config.analysis.routes.clone(),
        )),
        collector: registry,
        auxiliary: AuxiliaryRunner::default(),
        processor: Arc::new(JsonReporter::new(config.analysis.analyses_path())),
        realtime: Arc::new(NullRealtime),
        diaries: Arc::new(FileDiaryStore::new(config.massurl.diary_path.clone())),
        events: Arc::new(BusConnector::new(config.event_bus.clone())),
        config,
    });

    let mut scheduler = Scheduler::new(ctx, store, ManagerRegistry::default());
    scheduler
        .initialize()
        .await
        .context("Failed to initialize scheduler")?;
    info!("Scheduler initialized");

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if shutdown_signal().await {
            stop.stop();
        }
    });

    scheduler.run().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = result_server.await {
        error!("Result server task failed: {}", e);
    }

    info!("Sandbox Scheduler stopped");
    Ok(())
}

async fn shutdown_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
            true
        }
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            false
        }
    }
}
