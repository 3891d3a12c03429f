//! Satellite TCP listener: accept loop and per-connection tasks.
//!
//! Each accepted connection gets two tasks:
//!
//! 1. **Reader** – reads lines and hands them, one at a time, to a
//!    [`SatelliteConnection`].  Any line resets the heartbeat timer; clients
//!    keep idle connections alive with `PING`.
//! 2. **Writer** – drains the connection's outbound channel and writes each
//!    message as one `\n`-terminated line.
//!
//! The reader owns the connection.  When it stops (EOF, I/O error, `QUIT`,
//! heartbeat timeout) it closes the connection, which emits `Remove` for
//! every device added over it, and aborts the writer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use surface_core::protocol::satellite::SATELLITE_API_VERSION;
use surface_core::SatelliteMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::panel::SurfaceSink;
use crate::application::satellite_connection::{LineOutcome, SatelliteConnection};
use crate::application::variable_bridge::ExpressionEvaluator;

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Settings for one listener.
#[derive(Debug, Clone)]
pub struct SatelliteServerConfig {
    pub bind_addr: SocketAddr,
    /// Silence after which a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Reported to clients as `CompanionVersion`.
    pub hub_version: String,
}

/// Collaborators every connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub sink: Arc<dyn SurfaceSink>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub heartbeat_timeout: Duration,
    pub hub_version: String,
}

/// A bound listener.
pub struct SatelliteServer {
    listener: TcpListener,
    context: ConnectionContext,
}

impl SatelliteServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        config: &SatelliteServerConfig,
        sink: Arc<dyn SurfaceSink>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind Satellite listener on {}", config.bind_addr))?;
        info!("Satellite listener on {}", config.bind_addr);
        Ok(Self {
            listener,
            context: ConnectionContext {
                sink,
                evaluator,
                heartbeat_timeout: config.heartbeat_timeout,
                hub_version: config.hub_version.clone(),
            },
        })
    }

    /// Actual bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Propagates the OS error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `running` is cleared.
    pub async fn run(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let label = format!("{peer} [{}]", Uuid::new_v4());
                    info!("Satellite client connected: {label}");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("{label}: set_nodelay failed: {e}");
                    }
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, label, context).await;
                    });
                }
                Ok(Err(e)) => error!("accept error: {e}"),
                Err(_) => {}
            }
        }
        info!("Satellite listener stopped");
    }
}

/// Runs one Satellite connection to completion.
///
/// Generic over the stream so tests can drive it through an in-memory pipe.
pub async fn serve_connection<S>(stream: S, label: String, context: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let _ = outbound_tx.send(SatelliteMessage::Begin {
        companion_version: context.hub_version.clone(),
        api_version: SATELLITE_API_VERSION.to_string(),
    });
    let writer = tokio::spawn(write_lines(write_half, outbound_rx, label.clone()));

    let mut connection = SatelliteConnection::new(label.clone(), context.sink, context.evaluator, outbound_tx);
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match timeout(context.heartbeat_timeout, reader.read_until(b'\n', &mut buf)).await {
            Ok(Ok(0)) => {
                info!("{label}: client disconnected");
                break;
            }
            Ok(Ok(_)) => {
                // Bad bytes spoil the line, not the connection.
                let line = match std::str::from_utf8(&buf) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("{label}: skipping line that is not UTF-8: {e}");
                        continue;
                    }
                };
                if connection.handle_line(line).await == LineOutcome::Quit {
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!("{label}: read failed: {e}");
                break;
            }
            Err(_) => {
                warn!("{label}: no data for {:?}; closing", context.heartbeat_timeout);
                break;
            }
        }
    }

    connection.close();
    drop(connection);
    writer.abort();
    debug!("{label}: connection closed");
}

async fn write_lines<W>(mut write_half: W, mut outbound: mpsc::UnboundedReceiver<SatelliteMessage>, label: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = message.to_line();
        line.push('\n');
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!("{label}: write failed: {e}");
            break;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::host_variables::HostVariables;
    use crate::application::manage_surfaces::{SurfaceEvent, SurfaceRegistry};
    use crate::application::panel::PanelEvent;
    use tokio::io::{DuplexStream, Lines, ReadHalf};

    fn context(registry: &SurfaceRegistry, heartbeat: Duration) -> ConnectionContext {
        ConnectionContext {
            sink: Arc::new(registry.clone()),
            evaluator: Arc::new(HostVariables::new()),
            heartbeat_timeout: heartbeat,
            hub_version: "test".to_string(),
        }
    }

    async fn next_line(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> String {
        lines.next_line().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connection_greets_then_answers_ping() {
        // Arrange
        let (registry, _events) = SurfaceRegistry::new();
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, "t".to_string(), context(&registry, Duration::from_secs(5))));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        // Act
        let begin = next_line(&mut lines).await;
        write.write_all(b"PING hello\n").await.unwrap();
        let pong = next_line(&mut lines).await;

        // Assert
        assert_eq!(begin, "BEGIN CompanionVersion=test ApiVersion=1.8.0");
        assert_eq!(pong, "PONG hello");
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped_and_connection_stays_open() {
        // Arrange
        let (registry, mut events) = SurfaceRegistry::new();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, "t".to_string(), context(&registry, Duration::from_secs(5))));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        next_line(&mut lines).await;
        write.write_all(b"ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "ADD-DEVICE OK DEVICEID=a");

        // Act
        write
            .write_all(b"KEY-PRESS DEVICEID=a KEY=1 PRESSED=1 X=\xff\n")
            .await
            .unwrap();
        write.write_all(b"PING still-alive\n").await.unwrap();

        // Assert: the PING is answered and the device is still attached
        assert_eq!(next_line(&mut lines).await, "PONG still-alive");
        assert!(!task.is_finished());
        assert!(registry.contains("a"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_crlf_terminated_lines_are_accepted() {
        let (registry, _events) = SurfaceRegistry::new();
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, "t".to_string(), context(&registry, Duration::from_secs(5))));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        next_line(&mut lines).await;

        write.write_all(b"PING crlf\r\n").await.unwrap();

        assert_eq!(next_line(&mut lines).await, "PONG crlf");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_removes_every_device() {
        // Arrange
        let (registry, mut events) = SurfaceRegistry::new();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, "t".to_string(), context(&registry, Duration::from_secs(5))));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        next_line(&mut lines).await;
        write
            .write_all(b"ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4\nADD-DEVICE DEVICEID=b KEYS_TOTAL=4 KEYS_PER_ROW=4\n")
            .await
            .unwrap();
        assert_eq!(next_line(&mut lines).await, "ADD-DEVICE OK DEVICEID=a");
        assert_eq!(next_line(&mut lines).await, "ADD-DEVICE OK DEVICEID=b");

        // Act: stay silent past the timeout
        tokio::time::sleep(Duration::from_secs(6)).await;
        task.await.unwrap();

        // Assert
        let mut removed = Vec::new();
        while removed.len() < 2 {
            let SurfaceEvent { device_id, event } = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == PanelEvent::Remove {
                removed.push(device_id);
            }
        }
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_quit_closes_connection_and_frees_device_ids() {
        let (registry, mut events) = SurfaceRegistry::new();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, "t".to_string(), context(&registry, Duration::from_secs(5))));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        next_line(&mut lines).await;

        write.write_all(b"ADD-DEVICE DEVICEID=a\n").await.unwrap();
        next_line(&mut lines).await;
        write.write_all(b"QUIT\n").await.unwrap();
        task.await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.event == PanelEvent::Remove {
                    return event.device_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, "a");
    }
}
