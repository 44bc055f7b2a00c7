use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use hermes::backend::TcpConnector;
use hermes::config::{self, Config};
use hermes::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();

    if config.servers.is_empty() {
        warn!("No backend servers configured; every statement will fail to route");
    }

    let server = Server::start(config, Arc::new(TcpConnector))?;
    let shutdown = server.shutdown_token();

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    }

    server.join();
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/hermes.toml", "hermes.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
