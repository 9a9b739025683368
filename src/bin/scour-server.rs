//! Housekeeping daemon: wires config, store and scheduler, then waits for
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scour::{spawn_scheduler, AppConfig, Database, EventRegistry, HousekeepingService};

#[derive(Parser, Debug)]
#[command(name = "scour-server", about = "Retention & housekeeping job coordinator")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Path to the JSON config file (housekeeping settings + event registry)
    #[arg(long, env = "SCOUR_CONFIG", default_value = "scour.json")]
    config: PathBuf,

    /// Database connection pool size
    #[arg(long, env = "SCOUR_POOL_SIZE", default_value_t = 10)]
    pool_size: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = AppConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let registry = Arc::new(EventRegistry::new(config.events.clone()).context("building event registry")?);
    info!(events = registry.len(), "event registry loaded");

    let db = Database::connect_with_pool_size(&args.database_url, args.pool_size)
        .await
        .context("connecting to database")?;

    let service = Arc::new(HousekeepingService::new(
        db,
        registry.clone(),
        config.housekeeping.clone(),
    ));

    let handles = spawn_scheduler(service, registry, &config.housekeeping);
    info!(bindings = handles.len(), "scour scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    for handle in handles {
        handle.abort();
    }

    Ok(())
}
