//! conduit-manager: the Conduit control plane.
//!
//! Issues identities (CA + per-peer certificates) and disseminates the
//! live cluster view to every connected node.

mod cms;
mod config;
mod registry;
mod service;
mod store;

use clap::Parser;
use cms::Cms;
use config::Config;
use service::ManagerService;
use std::path::PathBuf;
use std::sync::Arc;
use store::Store;
use tokio::sync::broadcast;
use tracing::{error, info};

/// conduit-manager — Conduit control plane
#[derive(Parser, Debug)]
#[command(name = "conduit-manager", version, about = "Conduit manager")]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "./conduit-manager.yaml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("conduit-manager: {e}");
            std::process::exit(1);
        }
    };

    use tracing_subscriber::EnvFilter;
    let level = cli.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = %config.store.path,
        "starting conduit manager"
    );

    let store = match Store::open(&config.store.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot open store");
            std::process::exit(1);
        }
    };
    let cms = match Cms::init(store, config.cms_config()) {
        Ok(cms) => Arc::new(cms),
        Err(e) => {
            error!(error = %e, "certificate service init failed");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(4);
    let maintenance = tokio::spawn(cms.clone().run_maintenance(shutdown_tx.subscribe()));

    let service = ManagerService::new(cms);
    let server = tokio::spawn(service.run(config.listen.clone(), shutdown_tx.subscribe()));

    tokio::select! {
        result = server => {
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "manager server error");
                    std::process::exit(1);
                }
                _ => {}
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = maintenance.await;
    info!("conduit manager stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
