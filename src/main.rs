// src/main.rs

//! The main entry point for a standalone slotmesh node: the membership,
//! failure-detection and routing engine with an empty data store attached.

use anyhow::Result;
use slotmesh::config::Config;
use slotmesh::core::hooks::NullStore;
use slotmesh::core::state::Cluster;
use slotmesh::core::{bus, cron};
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("slotmesh version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; without one, built-in defaults apply.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match config_path {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Override port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) => config.port = port,
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting slotmesh {VERSION}, bus port {}", config.bus_port()?);

    let cluster = match Cluster::new(config, Arc::new(NullStore)) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("Cannot initialize cluster state: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let bus_task = tokio::spawn(bus::run(Arc::clone(&cluster), shutdown_tx.subscribe()));
    let cron_task = tokio::spawn(cron::run(Arc::clone(&cluster), shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping.");
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(bus_task, cron_task);
    Ok(())
}
