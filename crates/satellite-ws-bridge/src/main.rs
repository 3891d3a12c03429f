//! Satellite WebSocket bridge: entry point.
//!
//! Accepts Satellite clients over WebSocket and relays their line protocol to
//! the hub's Satellite TCP port.  Each WebSocket session becomes one TCP
//! connection, so the hub needs no WebSocket support of its own.
//!
//! # Usage
//!
//! ```text
//! satellite-ws-bridge [OPTIONS]
//!
//! Options:
//!   --ws-port       <PORT>  WebSocket listener port [default: 16623]
//!   --ws-bind       <IP>    WebSocket bind address [default: 0.0.0.0]
//!   --hub-host      <HOST>  Hub IP address [default: 127.0.0.1]
//!   --hub-port      <PORT>  Hub Satellite TCP port [default: 16622]
//!   --ping-interval <SECS>  Keepalive interval towards the hub [default: 2]
//! ```
//!
//! | Variable                   | Default     |
//! |----------------------------|-------------|
//! | `SATELLITE_WS_PORT`        | `16623`     |
//! | `SATELLITE_WS_BIND`        | `0.0.0.0`   |
//! | `SATELLITE_HUB_HOST`       | `127.0.0.1` |
//! | `SATELLITE_HUB_PORT`       | `16622`     |
//! | `SATELLITE_PING_INTERVAL`  | `2`         |
//!
//! CLI arguments win over environment variables.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use satellite_ws_bridge::domain::config::{BridgeConfig, DEFAULT_WS_PORT};
use satellite_ws_bridge::infrastructure::run_server;
use surface_core::protocol::satellite::DEFAULT_SATELLITE_PORT;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Satellite WebSocket bridge.
#[derive(Debug, Parser)]
#[command(
    name = "satellite-ws-bridge",
    about = "Relays Satellite clients connected over WebSocket to the SurfaceHub TCP listener",
    version
)]
struct Cli {
    /// TCP port for the WebSocket server.
    #[arg(long, default_value_t = DEFAULT_WS_PORT, env = "SATELLITE_WS_PORT")]
    ws_port: u16,

    /// IP address the WebSocket server binds to.
    ///
    /// `127.0.0.1` accepts only local clients.
    #[arg(long, default_value = "0.0.0.0", env = "SATELLITE_WS_BIND")]
    ws_bind: String,

    /// IP address of the hub.
    #[arg(long, default_value = "127.0.0.1", env = "SATELLITE_HUB_HOST")]
    hub_host: String,

    /// The hub's Satellite TCP port.
    #[arg(long, default_value_t = DEFAULT_SATELLITE_PORT, env = "SATELLITE_HUB_PORT")]
    hub_port: u16,

    /// Seconds between keepalive PINGs sent to the hub.
    #[arg(long, default_value_t = 2, env = "SATELLITE_PING_INTERVAL")]
    ping_interval: u64,
}

impl Cli {
    /// Converts the parsed arguments into a [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` or `--hub-host` is not an IP address,
    /// or if `--ping-interval` is zero.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, self.ws_port)
            .parse()
            .with_context(|| format!("invalid WebSocket bind address: '{}:{}'", self.ws_bind, self.ws_port))?;

        let hub_addr: SocketAddr = format!("{}:{}", self.hub_host, self.hub_port)
            .parse()
            .with_context(|| format!("invalid hub address: '{}:{}'", self.hub_host, self.hub_port))?;

        if self.ping_interval == 0 {
            anyhow::bail!("--ping-interval must be at least 1 second");
        }

        Ok(BridgeConfig {
            ws_bind_addr,
            hub_addr,
            ping_interval: Duration::from_secs(self.ping_interval),
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_bridge_config()?;

    info!(
        "Satellite WebSocket bridge starting: ws={}, hub={}",
        config.ws_bind_addr, config.hub_addr
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    run_server(config, running).await?;

    info!("Satellite WebSocket bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
