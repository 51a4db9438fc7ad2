//! gantry - echo server
//!
//! Serves length-prefixed frames over TCP and writes every frame back to its
//! sender.

use gantry_session::{Config, EchoHandler, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if GANTRY_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("GANTRY_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if std::env::var("GANTRY_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting gantry echo server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Framing: {}-byte lengths, {:?} endian, max frame {} bytes",
        config.framing.length_width.bytes(),
        config.framing.byte_order,
        config.framing.max_frame_size
    );
    tracing::info!(
        "  Session: idle timeout {:?}, queues {}/{}, max in flight {}",
        config.session.idle_timeout(),
        config.session.read_queue_capacity,
        config.session.write_queue_capacity,
        config.session.max_in_flight
    );

    let server = Arc::new(Server::from_config(&config, EchoHandler));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
