//! End-to-end relay test: a WebSocket client talks to a scripted hub through
//! a bridge bound on ephemeral ports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use satellite_ws_bridge::domain::BridgeConfig;
use satellite_ws_bridge::infrastructure::WsBridgeServer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// A hub that greets, answers PING with PONG, acknowledges every other line
/// with `GOT <line>`, and reports every line it received on the channel.
async fn scripted_hub() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        write.write_all(b"BEGIN CompanionVersion=test ApiVersion=1.8.0\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match line.strip_prefix("PING ") {
                Some(payload) => format!("PONG {payload}\n"),
                None => format!("GOT {line}\n"),
            };
            let _ = seen_tx.send(line);
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    (addr, seen_rx)
}

async fn start_bridge(hub_addr: SocketAddr, ping_interval: Duration) -> (SocketAddr, Arc<AtomicBool>) {
    let config = BridgeConfig {
        ws_bind_addr: "127.0.0.1:0".parse().unwrap(),
        hub_addr,
        ping_interval,
    };
    let server = WsBridgeServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(server.run(Arc::clone(&running)));
    (addr, running)
}

#[tokio::test]
async fn test_frames_and_lines_cross_the_bridge() {
    // Arrange
    let (hub_addr, mut seen) = scripted_hub().await;
    let (ws_addr, running) = start_bridge(hub_addr, Duration::from_secs(60)).await;
    let (mut ws, _) = connect_async(format!("ws://{ws_addr}")).await.unwrap();

    assert!(next_frame(&mut ws).await.starts_with("BEGIN "));

    // Act: two lines in one frame
    ws.send(Message::Text("ADD-DEVICE DEVICEID=a\nPING 42".to_string()))
        .await
        .unwrap();

    // Assert
    assert_eq!(next_frame(&mut ws).await, "GOT ADD-DEVICE DEVICEID=a");
    assert_eq!(next_frame(&mut ws).await, "PONG 42");
    assert_eq!(timeout(WAIT, seen.recv()).await.unwrap().unwrap(), "ADD-DEVICE DEVICEID=a");
    assert_eq!(timeout(WAIT, seen.recv()).await.unwrap().unwrap(), "PING 42");

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_keepalive_reaches_hub_but_not_client() {
    // Arrange
    let (hub_addr, mut seen) = scripted_hub().await;
    let (ws_addr, running) = start_bridge(hub_addr, Duration::from_millis(100)).await;
    let (mut ws, _) = connect_async(format!("ws://{ws_addr}")).await.unwrap();
    assert!(next_frame(&mut ws).await.starts_with("BEGIN "));

    // Act: let a few keepalives go by, then send a marker
    let first = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    ws.send(Message::Text("MARKER".to_string())).await.unwrap();

    // Assert: the hub saw the keepalives, the client only sees the marker ack
    assert_eq!(first, "PING ws-bridge-keepalive");
    assert_eq!(second, "PING ws-bridge-keepalive");
    assert_eq!(next_frame(&mut ws).await, "GOT MARKER");

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_silent_client_is_disconnected_from_hub() {
    // Arrange
    let (hub_addr, mut seen) = scripted_hub().await;
    let (ws_addr, running) = start_bridge(hub_addr, Duration::from_millis(50)).await;

    // Act: connect, then never read or send again
    let (_ws, _) = connect_async(format!("ws://{ws_addr}")).await.unwrap();

    // Assert: a few keepalives at most, then the hub connection closes
    let mut keepalives = 0;
    while let Some(line) = timeout(WAIT, seen.recv()).await.unwrap() {
        assert_eq!(line, "PING ws-bridge-keepalive");
        keepalives += 1;
    }
    assert!(keepalives <= 3, "got {keepalives} keepalives from a silent client");

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_hub_unavailable_closes_websocket() {
    // Arrange: a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();
    drop(listener);
    let (ws_addr, running) = start_bridge(hub_addr, Duration::from_secs(60)).await;

    // Act
    let (mut ws, _) = connect_async(format!("ws://{ws_addr}")).await.unwrap();

    // Assert: the stream ends (or errors) without any text frame
    let outcome = timeout(WAIT, ws.next()).await.unwrap();
    assert!(!matches!(outcome, Some(Ok(Message::Text(_)))));

    running.store(false, Ordering::SeqCst);
}

/// Next text frame, skipping control frames.
async fn next_frame<S>(ws: &mut S) -> String
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return text,
            _ => continue,
        }
    }
}
