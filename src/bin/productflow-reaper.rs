//! Runs the stale-product reaper against a product store.
//!
//! Usage: productflow-reaper [config.yaml] [log-level]

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, Level};

use productflow::telemetry::{init_tracing, parse_level};
use productflow::{Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let level = match args.next() {
        Some(name) => parse_level(&name)?,
        None => Level::INFO,
    };
    init_tracing(level)?;

    let config = match &config_path {
        Some(path) => CoordinatorConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path))?,
        None => CoordinatorConfig::default(),
    };
    let coordinator = Coordinator::new(config).context("opening product store")?;
    info!(
        "Product store holds {} products",
        coordinator.store().len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = coordinator.reaper();
    let task = tokio::spawn(async move { reaper.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Interrupt received, stopping reaper");
    shutdown_tx.send(true)?;
    task.await??;

    coordinator.store().flush().await?;
    Ok(())
}
