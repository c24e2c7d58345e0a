use anyhow::{Context, Result};
use beacon_config::{BeaconConfig, LogFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Metrics observability backend: ingest gateway, stream worker, query
/// service.
#[derive(Parser)]
#[command(name = "beacon")]
#[command(version)]
#[command(about = "Metrics observability backend", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP ingest gateway
    Gateway,
    /// Run the stream worker (bus consumer, storage writer, rollups)
    Worker,
    /// Run the query & signals service
    Query,
    /// Run all three components in one process over the in-memory bus
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(path) = &cli.config {
        BeaconConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        BeaconConfig::load_or_default().context("failed to load configuration")?
    };

    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }

    init_tracing(&config);

    match cli.command {
        Command::Gateway => beacon_gateway::run(config).await,
        Command::Worker => beacon_worker::run(config).await,
        Command::Query => beacon_query::run(config).await,
        Command::All => run_all(config).await,
    }
}

/// Single-process mode: gateway, worker and query share an in-memory bus
/// and one store. Start leaves-first, stop everything on the first signal.
async fn run_all(config: BeaconConfig) -> Result<()> {
    use beacon_bus::MemoryBus;
    use beacon_store::Store;

    let bus = MemoryBus::new(config.bus.partitions);
    let store = Arc::new(
        Store::from_config(&config.storage, &config.retention)
            .map_err(|e| anyhow::anyhow!("store init: {e}"))?,
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let wait = |mut rx: tokio::sync::broadcast::Receiver<()>| async move {
        let _ = rx.recv().await;
    };

    let gateway = tokio::spawn(beacon_gateway::serve(
        config.clone(),
        Arc::new(bus.producer()),
        wait(shutdown_tx.subscribe()),
    ));
    let worker = tokio::spawn(beacon_worker::serve(
        config.clone(),
        bus.consumer(&config.worker.consumer_group),
        Arc::clone(&store),
        wait(shutdown_tx.subscribe()),
    ));
    let query = tokio::spawn(beacon_query::serve(
        config.clone(),
        store,
        wait(shutdown_tx.subscribe()),
    ));

    beacon_gateway::shutdown_signal().await;
    info!("stopping all components");
    let _ = shutdown_tx.send(());

    for (name, handle) in [("gateway", gateway), ("worker", worker), ("query", query)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e).with_context(|| format!("{name} failed")),
            Err(e) => anyhow::bail!("{name} task panicked: {e}"),
        }
    }
    Ok(())
}

fn init_tracing(config: &BeaconConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}
