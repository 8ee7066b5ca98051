use anyhow::Result;
use quarry::config::QuarryConfig;
use quarry::db;
use quarry::machines::Machine;
use quarry::queries::PgQueueDb;
use quarry::queue::{State, Step};
use quarry::store::NixStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = QuarryConfig::load()?;
    let pool = cfg.db_pool().await?;
    db::init_db(&pool).await?;

    let machines: Vec<Machine> = cfg
        .machines
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(Machine::from_config)
        .collect();
    if machines.is_empty() {
        warn!("⚠️ no [[machines]] configured; every queued build will be unsupported");
    }

    let (runnable_tx, mut runnable_rx) = mpsc::unbounded_channel::<Arc<Step>>();

    // Stand-in for the worker pool until one is attached: log what becomes
    // runnable.
    tokio::spawn(async move {
        while let Some(step) = runnable_rx.recv().await {
            info!("🔨 runnable: {}", step.drv_path);
        }
    });

    let state = State::new(
        Arc::new(PgQueueDb::new(pool.clone())),
        Arc::new(NixStore::new()),
        machines,
        &cfg.queue(),
        runnable_tx,
    );

    info!("🔁 starting queue monitor");
    state.run(pool).await;

    Ok(())
}
