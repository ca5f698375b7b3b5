//! `serve` command.

use std::net::SocketAddr;

use crate::config::{Config, ServerConfig};
use crate::server::PairingServer;

/// Serve the pairing API until Ctrl-C.
pub async fn run_serve_command(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let addr = match port {
        Some(port) => SocketAddr::new(config.server.addr.ip(), port),
        None => config.server.addr,
    };

    if config.backend.base_url.is_none() {
        tracing::warn!("SESSIONS_API_URL is not set, credential bundles will not be uploaded");
    }

    let orchestrator = super::build_orchestrator(&config, false);
    tracing::info!(
        sessions_root = %orchestrator.store().root().display(),
        bridge = %config.bridge.url,
        "Pairing sessions configured"
    );
    let mut server = PairingServer::new(ServerConfig { addr }, orchestrator);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
