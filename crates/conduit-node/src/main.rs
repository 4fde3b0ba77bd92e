//! conduit: the Conduit node.
//!
//! Runs the client role (transparent interception and tunneling), the
//! server role (tunnel termination), or both, optionally synchronized with
//! a central manager.

mod config;
mod dial;
mod intercept;
mod node;
mod repo;
mod server;
mod sock;
mod syncer;
mod tables;

use clap::Parser;
use config::Config;
use node::Node;
use std::path::PathBuf;
use tracing::{error, info};

/// conduit — transparent TCP tunneling node
#[derive(Parser, Debug)]
#[command(name = "conduit", version, about = "Conduit node")]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "./conduit.yaml")]
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
            eprintln!("conduit: {e}");
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
        client = config.client.enable,
        server = config.server.enable,
        manager = config.manager.enable,
        "starting conduit node"
    );

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("received shutdown signal");
    node.shutdown().await;
    info!("conduit node stopped");
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
