//! Aimlink Signaling Relay
//!
//! Pairs two peers through a short lobby code and forwards their WebRTC
//! negotiation payloads. Gameplay traffic never touches the relay.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use aimlink::{RelayConfig, RelayServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = RelayConfig::from_env();
    info!("Aimlink relay v{}", VERSION);
    info!("Bind address: {}", config.bind_addr);
    info!("Max connections: {}", config.max_connections);

    let server = std::sync::Arc::new(RelayServer::new(config));

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await.context("Relay server failed")?;
    info!("Relay stopped");
    Ok(())
}
