use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use feedkeeper::batcher::{HttpExecutor, RequestBatcher};
use feedkeeper::config::{ConfigStore, LoadOutcome, PollingChangeSource, spawn_hot_reload};
use feedkeeper::feeds::PriceFeed;
use feedkeeper::logging;
use feedkeeper::service::{ServiceRegistry, ServiceRunner};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "feedkeeper.json")]
    config: PathBuf,

    /// How often the config file is checked for changes
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load environment variables
    dotenvy::dotenv().ok();

    let store = Arc::new(ConfigStore::new(Some(args.config.clone())));
    let outcome = store.load();

    if let Some(path) = &args.export {
        store
            .export_to(path)
            .with_context(|| format!("Failed to export configuration to {}", path.display()))?;
        println!("Configuration exported to {}", path.display());
        return Ok(());
    }

    let config = store.config();
    let logging = logging::init(&config.logging).context("Failed to initialize logging")?;
    let _logging_watch = logging.follow_config(&store)?;

    match &outcome {
        LoadOutcome::Applied {
            file_found,
            overrides,
            ..
        } => info!(
            path = %args.config.display(),
            file_found,
            overrides,
            "Configuration loaded"
        ),
        LoadOutcome::Retained { reason } => warn!(reason = %reason, "Using default configuration"),
    }
    for warning in store.warnings() {
        warn!(warning = %warning, "Configuration warning");
    }

    let executor = HttpExecutor::from_config(&config).context("Failed to build HTTP client")?;
    let batcher = RequestBatcher::from_config(Arc::new(executor), &config);
    let _batcher_watch = batcher.follow_config(&store)?;

    let mut registry = ServiceRegistry::new();
    let mut watches = Vec::new();
    let market = ServiceRunner::from_store(PriceFeed::new(batcher.clone(), store.clone()), &store);
    if config.services.tuning(market.name()).enabled {
        watches.push(market.follow_config(&store)?);
        registry.register(Arc::new(market))?;
    }

    let cancel = CancellationToken::new();
    let reload_task = config.features.hot_reload.then(|| {
        let source =
            PollingChangeSource::new(&args.config, Duration::from_millis(args.poll_interval_ms));
        spawn_hot_reload(store.clone(), source, cancel.clone())
    });

    registry.start_all().await;
    info!(services = registry.len(), "feedkeeper running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    registry.stop_all();
    cancel.cancel();
    if let Some(task) = reload_task {
        task.await.ok();
    }
    let cleared = batcher.clear_queue();

    for status in registry.health_report() {
        info!(
            service = %status.name,
            state = %status.state,
            total_requests = status.total_requests,
            consecutive_failures = status.consecutive_failures,
            "Final service status"
        );
    }
    info!(cleared, "feedkeeper stopped");

    Ok(())
}
