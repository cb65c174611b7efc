//! Raftainer Orchestrator - per-node container orchestration agent
//!
//! This is the main entry point for the Raftainer node agent.
//! It holds a Consul session for this host and converges Docker containers
//! for every pod slot the host wins.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use raftainer_orchestrator::agent::NodeAgent;
use raftainer_orchestrator::config::AppConfig;
use raftainer_orchestrator::container::DockerRuntime;
use raftainer_orchestrator::coordination::{ConsulClient, SessionConfig, SessionManager};
use raftainer_orchestrator::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node_name,
        region = %config.region,
        "Starting Raftainer Orchestrator"
    );

    // Initialize metrics system
    if config.metrics.enabled {
        raftainer_orchestrator::metrics::init_metrics(&config.metrics)?;
        info!(addr = %config.metrics.listen_addr, "Prometheus metrics initialized");
    }

    // Connect to Docker
    let docker = DockerRuntime::connect(&config.docker).context("Failed to connect to Docker")?;
    let docker_version = docker
        .version()
        .await
        .context("Docker is not reachable")?;
    info!(version = %docker_version, "Connected to Docker");

    // Connect to Consul
    let consul = Arc::new(ConsulClient::new(config.consul.clone()).context("Failed to create Consul client")?);
    info!(address = %config.consul.address, "Using Consul");

    // Establish the host session; without it nothing may run
    let sessions = SessionManager::new(consul.clone(), SessionConfig::from_app_config(&config));
    let keeper = sessions
        .start(config.fast_startup)
        .await
        .context("Failed to establish host session")?;

    let agent = NodeAgent::from_config(&config, consul, Arc::new(docker));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down...");
        signal_token.cancel();
    });

    agent.run(&sessions, keeper, shutdown).await;

    info!("Raftainer Orchestrator stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
