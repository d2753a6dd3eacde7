//! # fleet-runner
//!
//! Runs one fleet node: serves the RPC health endpoint, registers in the
//! service registry, keeps the registration alive, and cleans up on Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! fleet-runner config.json --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fleet_client::ConnectionManager;
use fleet_core::ServingStatus;
use fleet_core::rpc::RpcServer;
use tracing::{error, info};

/// Fleet service node runner.
#[derive(Parser)]
#[command(name = "fleet-runner", about = "Fleet service node runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config file.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration, then logging (CLI flags win)
    let config = fleet_core::config::load_config(&cli.config)?;
    let mut logging = config.logging.clone();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    if cli.log_dir.is_some() {
        logging.log_dir = cli.log_dir;
    }
    fleet_core::logging::init_from_config(&logging, &config.service.name)?;

    let name = config.service.name.clone();
    info!("fleet-runner starting: service={name} config={}", cli.config.display());

    // 2. Serve RPC health checks
    let server = RpcServer::bind(&format!("0.0.0.0:{}", config.service.rpc_port)).await?;
    server
        .health()
        .set_serving_status(&name, ServingStatus::Serving)
        .await;
    let mut server = server.start()?;

    // 3. Connect to the registry and configuration service
    let manager = Arc::new(ConnectionManager::from_config(&config)?);
    manager.initialize().await?;

    // 4. Register and keep the registration alive
    let directory = Arc::clone(manager.directory());
    directory.register_self().await?;
    directory.spawn_heartbeat().await;

    let peers = manager.discover_services().await;
    info!("{} peer instance(s) currently registered", peers.len());
    for record in &peers {
        info!(
            "  {} {} at {} ({})",
            record.name,
            record.version,
            record.rpc_target(),
            record.status
        );
    }

    info!("{name} running, press Ctrl+C to stop");

    // 5. Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown signal received");

    // 6. Deregister, close peers, stop serving
    manager.cleanup().await;
    let stats = manager.get_connection_stats().await;
    info!(
        "connections: total={} failed={} active={}",
        stats.total_connections, stats.failed_connections, stats.active_connections
    );
    server.stop().await;

    info!("{name} stopped");
    Ok(())
}
