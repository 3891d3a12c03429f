//! TCP connection to the hub's Satellite listener.
//!
//! Each WebSocket session gets its own connection, so the hub sees every
//! bridged client as an ordinary Satellite client.  TCP is a byte stream:
//! [`read_hub_lines`] buffers it and hands complete lines on.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Both halves of a connected hub socket.
pub struct HubConnection {
    pub read_half: OwnedReadHalf,
    pub write_half: OwnedWriteHalf,
}

impl HubConnection {
    /// Connects to the hub at `hub_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not listening or unreachable.
    pub async fn connect(hub_addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(hub_addr)
            .await
            .with_context(|| format!("failed to connect to hub at {hub_addr}"))?;
        // Key presses are tiny; do not let Nagle hold them back.
        stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self { read_half, write_half })
    }
}

/// Reads lines from the hub and sends each one to `tx`.
///
/// Returns when the hub closes the socket, a read fails, or the receiver is
/// dropped.
pub async fn read_hub_lines(read_half: OwnedReadHalf, session_id: &str, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    debug!("session {session_id}: line receiver dropped");
                    break;
                }
            }
            Ok(None) => {
                debug!("session {session_id}: hub closed the connection");
                break;
            }
            Err(e) => {
                warn!("session {session_id}: hub read error: {e}");
                break;
            }
        }
    }
}

/// Writes one already-terminated line to the hub.
///
/// # Errors
///
/// Returns an error if the socket write fails.
pub async fn write_hub_line(write_half: &mut OwnedWriteHalf, line: &str, session_id: &str) -> anyhow::Result<()> {
    write_half
        .write_all(line.as_bytes())
        .await
        .with_context(|| format!("session {session_id}: failed to write to hub"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
