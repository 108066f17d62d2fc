//! Kari System Agent - Entry Point
//!
//! The root-privileged half of the Kari panel. Binds the local RPC socket,
//! enforces the peer-UID gate, and executes deployment intents against
//! the host.

use std::sync::Arc;

use kari_agent::config::AgentConfig;
use kari_agent::logs::{init_logging, LogOptions};
use kari_agent::rpc::handlers::AgentHandlers;
use kari_agent::rpc::serve::serve;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(LogOptions::default()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match AgentConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid agent configuration: {e}");
            std::process::exit(1);
        }
    };

    info!(
        socket = %config.socket_path.display(),
        expected_brain_uid = config.expected_brain_uid,
        "Starting Kari agent"
    );

    let handlers = Arc::new(AgentHandlers::new(config.clone()));

    let server = match serve(&config, handlers, await_shutdown_signal()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start RPC server: {e}");
            std::process::exit(1);
        }
    };

    match server.await {
        Ok(Ok(())) => info!("Agent shut down cleanly"),
        Ok(Err(e)) => error!("RPC server error: {e}"),
        Err(e) => error!("RPC server task panicked: {e}"),
    }
}

async fn await_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down...");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down...");
        }
    }
}
