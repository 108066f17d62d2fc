//! Kari Brain - Entry Point
//!
//! The unprivileged orchestration half of the Kari panel. Terminates
//! HTTP, drives site activation through the agent, and fans build logs
//! out to browser terminals.

use kari_brain::app::run::run;
use kari_brain::config::BrainConfig;
use kari_brain::logs::{init_logging, LogOptions};

use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(LogOptions::default()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match BrainConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid brain configuration: {e}");
            std::process::exit(1);
        }
    };

    info!(
        http = config.http_address,
        transport = ?config.agent_transport,
        "Starting Kari brain"
    );

    if let Err(e) = run(config, await_shutdown_signal()).await {
        error!("Failed to run the brain: {e}");
        std::process::exit(1);
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
