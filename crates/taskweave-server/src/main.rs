// Taskweave engine server: hosts the engine plus the two periodic sweepers
// (delayed calls, cron triggers). The RPC/REST surface in front of the
// engine façade lives elsewhere; this process is the execution node.

use std::sync::Arc;

use anyhow::Result;
use taskweave_core::EngineConfig;
use taskweave_engine::{CronTriggerProcessor, DelayedCallScheduler, Engine};
use taskweave_storage::{MemoryStore, PgStore, StateStore};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskweave_engine=info,taskweave_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("taskweave-server starting...");

    let config = EngineConfig::from_env();

    let store: Arc<dyn StateStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let store = PgStore::from_url(&database_url, config.execution_field_size_limit_kb)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            tracing::info!("Database connection established, migrations applied");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store (not durable)");
            Arc::new(MemoryStore::new(config.execution_field_size_limit_kb))
        }
    };

    let engine = Engine::new(store, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = DelayedCallScheduler::new(engine.clone(), shutdown_rx.clone()).spawn();
    let cron = CronTriggerProcessor::new(engine.clone(), shutdown_rx).spawn();

    tracing::info!("Engine ready; sweepers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(scheduler, cron);

    Ok(())
}
