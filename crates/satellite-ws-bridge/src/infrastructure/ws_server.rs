//! WebSocket server: accept loop and per-session relay tasks.
//!
//! For every accepted client this module:
//!
//! 1. Completes the WebSocket handshake.
//! 2. Opens a TCP connection to the hub.
//! 3. Runs four tasks until one of them ends:
//!    - **Hub reader**: splits the TCP stream into lines.
//!    - **Hub → client**: sends each line as one text frame, minus the
//!      replies to the bridge's own keepalive.
//!    - **Client → hub**: splits frames into lines and writes them to the hub.
//!    - **Keepalive**: every `ping_interval`, pings the client with a
//!      WebSocket Ping frame and, while the client is still answering, sends
//!      `PING ws-bridge-keepalive` to the hub.  A client silent for
//!      [`CLIENT_SILENCE_INTERVALS`] intervals ends the session.
//!
//! When a relay task ends the others are aborted, which closes both sockets.  The
//! hub then sees an ordinary disconnect and removes the client's devices.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{
    binary_frame_to_lines, client_is_alive, frame_to_lines, hub_line_to_frame, keepalive_line, CLIENT_SILENCE_INTERVALS,
};
use crate::domain::config::BridgeConfig;
use crate::infrastructure::hub_conn::{read_hub_lines, write_hub_line, HubConnection};

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Hub lines buffered per session before the reader waits.
const LINE_BUFFER: usize = 128;

// ── Public API ────────────────────────────────────────────────────────────────

/// A bound WebSocket listener, ready to accept clients.
pub struct WsBridgeServer {
    listener: TcpListener,
    config: Arc<BridgeConfig>,
}

impl WsBridgeServer {
    /// Binds the WebSocket port.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is in use or cannot be bound.
    pub async fn bind(config: BridgeConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.ws_bind_addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {}", config.ws_bind_addr))?;
        info!("WebSocket bridge listening on {}", config.ws_bind_addr);
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// The address actually bound (useful when the port was 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `running` is cleared.
    pub async fn run(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    info!("new WebSocket connection from {peer_addr}");
                    let cfg = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        handle_session(stream, peer_addr, cfg).await;
                    });
                }
                Ok(Err(e)) => error!("accept error: {e}"),
                Err(_) => {}
            }
        }
        info!("shutdown flag set; stopping accept loop");
    }
}

/// Binds `config.ws_bind_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(config: BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    WsBridgeServer::bind(config).await?.run(running).await;
    Ok(())
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_session(raw_stream: TcpStream, peer_addr: SocketAddr, config: Arc<BridgeConfig>) {
    let session_id = format!("{peer_addr} [{}]", Uuid::new_v4());
    match run_session(raw_stream, &session_id, config).await {
        Ok(()) => info!("session {session_id} closed"),
        Err(e) => warn!("session {session_id} closed with error: {e:#}"),
    }
}

async fn run_session(raw_stream: TcpStream, session_id: &str, config: Arc<BridgeConfig>) -> anyhow::Result<()> {
    let ws_stream = accept_async(raw_stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {session_id}"))?;

    let hub = HubConnection::connect(config.hub_addr)
        .await
        .with_context(|| format!("session {session_id}: hub unavailable"))?;
    info!("session {session_id}: relaying to hub at {}", config.hub_addr);

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));
    let hub_write = Arc::new(Mutex::new(hub.write_half));
    let last_heard = Arc::new(std::sync::Mutex::new(Instant::now()));
    let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);

    // ── Task A: hub reader ────────────────────────────────────────────────────
    let sid = session_id.to_string();
    let hub_reader_task = tokio::spawn(async move {
        read_hub_lines(hub.read_half, &sid, line_tx).await;
    });

    // ── Task B: hub → client ─────────────────────────────────────────────────
    let sid = session_id.to_string();
    let ws_tx_h2c = Arc::clone(&ws_tx);
    let hub_to_client_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let Some(frame) = hub_line_to_frame(&line) else {
                continue;
            };
            if ws_tx_h2c.lock().await.send(WsMessage::Text(frame)).await.is_err() {
                debug!("session {sid}: WebSocket send failed (client gone)");
                break;
            }
        }
        // Best effort: tell the client the hub side is gone.
        let _ = ws_tx_h2c.lock().await.send(WsMessage::Close(None)).await;
    });

    // ── Task C: client → hub ─────────────────────────────────────────────────
    let sid = session_id.to_string();
    let hub_write_c2h = Arc::clone(&hub_write);
    let last_heard_c2h = Arc::clone(&last_heard);
    let client_to_hub_task = tokio::spawn(async move {
        loop {
            let message = match ws_rx.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                    debug!("session {sid}: client WebSocket closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!("session {sid}: client WebSocket error: {e}");
                    break;
                }
                None => break,
            };
            *last_heard_c2h.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

            let lines = match message {
                WsMessage::Text(text) => frame_to_lines(&text),
                WsMessage::Binary(data) => match binary_frame_to_lines(&data) {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!("session {sid}: {e}");
                        continue;
                    }
                },
                WsMessage::Close(_) => {
                    debug!("session {sid}: Close frame received");
                    break;
                }
                // Protocol-level ping/pong is answered by tungstenite.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };

            let mut write = hub_write_c2h.lock().await;
            for line in lines {
                if let Err(e) = write_hub_line(&mut write, &line, &sid).await {
                    warn!("{e:#}");
                    return;
                }
            }
        }
    });

    // ── Task D: keepalive ────────────────────────────────────────────────────
    let sid = session_id.to_string();
    let hub_write_ping = Arc::clone(&hub_write);
    let ws_tx_ping = Arc::clone(&ws_tx);
    let ping_interval = config.ping_interval;
    let keepalive_task = tokio::spawn(async move {
        let mut ticker = interval(ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let silent_for = last_heard.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
            if !client_is_alive(silent_for, ping_interval) {
                info!("session {sid}: client silent for {silent_for:?}; closing");
                break;
            }
            if ws_tx_ping.lock().await.send(WsMessage::Ping(Vec::new())).await.is_err() {
                debug!("session {sid}: WebSocket ping failed (client gone)");
                break;
            }
            let mut write = hub_write_ping.lock().await;
            if let Err(e) = write_hub_line(&mut write, &keepalive_line(), &sid).await {
                debug!("session {sid}: keepalive failed: {e:#}");
                break;
            }
        }
    });

    let aborts = [
        hub_reader_task.abort_handle(),
        hub_to_client_task.abort_handle(),
        client_to_hub_task.abort_handle(),
        keepalive_task.abort_handle(),
    ];

    // The hub reader is not raced: when it ends, task B drains the remaining
    // lines and then finishes on its own.
    tokio::select! {
        _ = hub_to_client_task => debug!("session {session_id}: hub → client ended"),
        _ = client_to_hub_task => debug!("session {session_id}: client → hub ended"),
        _ = keepalive_task => debug!("session {session_id}: keepalive ended"),
    }

    for handle in aborts {
        handle.abort();
    }
    Ok(())
}
