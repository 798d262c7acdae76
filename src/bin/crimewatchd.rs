//! crimewatchd - camera monitoring daemon
//!
//! This daemon:
//! 1. Loads the camera catalog and pipeline settings
//! 2. Builds the classifier, alert store, snapshot store and notifiers
//! 3. Serves viewer streams, status and the alert feed over HTTP
//! 4. Starts camera pipelines on first request and stops them all on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use crimewatch::api::{ApiConfig, ApiServer};
use crimewatch::{WatchConfig, WatchService};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "CRIMEWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// HTTP listen address; overrides the config file.
    #[arg(long, env = "CRIMEWATCH_API_ADDR")]
    api_addr: Option<String>,
    /// Start every active camera at boot instead of on first viewer.
    #[arg(long)]
    eager: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WatchConfig::load_from(path)?,
        None => WatchConfig::load()?,
    };
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    log::info!(
        "crimewatchd {} starting: {} camera(s), backend {}, db {}",
        env!("CARGO_PKG_VERSION"),
        config.active_cameras().len(),
        config.inference.backend,
        config.db_path
    );

    let service = Arc::new(WatchService::from_config(&config)?);
    if args.eager {
        for camera in service.active_cameras() {
            match service.status(camera.id) {
                Ok(_) => log::info!("camera={} ({}) started", camera.id, camera.name),
                Err(err) => log::warn!("camera={} failed to start: {:#}", camera.id, err),
            }
        }
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
    log::info!("camera api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("crimewatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipelines and API server...");
    let stopped = service.shutdown()?;
    log::info!("{} pipeline(s) stopped", stopped);
    api_handle.stop()?;

    Ok(())
}
