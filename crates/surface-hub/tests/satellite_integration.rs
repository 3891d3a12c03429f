//! End-to-end test of the Satellite server over real TCP sockets.
//!
//! Two clients connect to a server bound on an ephemeral port.  One pushes a
//! custom variable, the other shows an output expression that reads it.  The
//! hub's event pump (`route_event`) is the only thing wiring them together.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use surface_core::protocol::satellite::parse_line;
use surface_core::{FamilyConfig, PanelConfig};
use surface_hub::application::host_variables::HostVariables;
use surface_hub::application::manage_surfaces::{route_event, SurfaceRegistry};
use surface_hub::infrastructure::network::satellite_server::{SatelliteServer, SatelliteServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    /// Reads lines until one starts with `prefix`, skipping the rest.
    async fn expect(&mut self, prefix: &str) -> String {
        timeout(WAIT, async {
            loop {
                let line = self.lines.next_line().await.unwrap().expect("connection closed");
                if line.starts_with(prefix) {
                    return line;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no line starting with {prefix:?}"))
    }
}

fn declare(variables: serde_json::Value) -> String {
    BASE64.encode(variables.to_string())
}

/// Decodes the VALUE of a VARIABLE-VALUE line.
fn variable_value(line: &str) -> String {
    let (_, params) = parse_line(line).unwrap();
    params.base64_text("VALUE").unwrap().unwrap_or_default()
}

async fn wait_attached(registry: &SurfaceRegistry, device_id: &str) {
    timeout(WAIT, async {
        while !registry.contains(device_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn start_hub() -> (SurfaceRegistry, std::net::SocketAddr, Arc<AtomicBool>) {
    let (registry, mut events) = SurfaceRegistry::new();
    let variables = Arc::new(HostVariables::new());
    let running = Arc::new(AtomicBool::new(true));

    let config = SatelliteServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_timeout: Duration::from_secs(30),
        hub_version: "test".to_string(),
    };
    let server = SatelliteServer::bind(&config, Arc::new(registry.clone()), variables.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(Arc::clone(&running)));

    let pump_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            route_event(&pump_registry, &variables, event);
        }
    });

    (registry, addr, running)
}

#[tokio::test]
async fn test_custom_variable_reaches_output_on_other_client() {
    // Arrange
    let (registry, addr, running) = start_hub().await;

    let mut fader = Client::connect(addr).await;
    fader.expect("BEGIN").await;
    let inputs = declare(serde_json::json!([{ "id": "level", "type": "input", "name": "Level" }]));
    fader.send(&format!("ADD-DEVICE DEVICEID=fader VARIABLES={inputs}")).await;
    fader.expect("ADD-DEVICE OK").await;

    let mut display = Client::connect(addr).await;
    display.expect("BEGIN").await;
    let outputs = declare(serde_json::json!([{ "id": "shown", "type": "output", "name": "Shown" }]));
    display.send(&format!("ADD-DEVICE DEVICEID=display VARIABLES={outputs}")).await;
    display.expect("ADD-DEVICE OK").await;

    wait_attached(&registry, "fader").await;
    wait_attached(&registry, "display").await;

    registry
        .get("fader")
        .unwrap()
        .set_config(
            PanelConfig::new(FamilyConfig::Satellite {
                bindings: BTreeMap::from([("level".to_string(), "fader_level".to_string())]),
            }),
            false,
        )
        .await;
    registry
        .get("display")
        .unwrap()
        .set_config(
            PanelConfig::new(FamilyConfig::Satellite {
                bindings: BTreeMap::from([("shown".to_string(), "Level: $(fader_level)".to_string())]),
            }),
            false,
        )
        .await;

    // Nothing has been pushed yet, so the reference reads empty.
    let first = display.expect("VARIABLE-VALUE").await;
    assert_eq!(variable_value(&first), "Level: ");

    // Act
    fader
        .send(&format!(
            "SET-VARIABLE-VALUE DEVICEID=fader VARIABLE=level VALUE={}",
            BASE64.encode("7")
        ))
        .await;

    // Assert
    let updated = display.expect("VARIABLE-VALUE").await;
    assert!(updated.contains("DEVICEID=display"));
    assert!(updated.contains("VARIABLE=shown"));
    assert_eq!(variable_value(&updated), "Level: 7");

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_disconnect_frees_device_id_for_reconnect() {
    // Arrange
    let (registry, addr, running) = start_hub().await;
    let mut first = Client::connect(addr).await;
    first.expect("BEGIN").await;
    first.send("ADD-DEVICE DEVICEID=panel").await;
    first.expect("ADD-DEVICE OK").await;
    wait_attached(&registry, "panel").await;

    // Act
    drop(first);
    timeout(WAIT, async {
        while registry.contains("panel") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut second = Client::connect(addr).await;
    second.expect("BEGIN").await;
    second.send("ADD-DEVICE DEVICEID=panel").await;

    // Assert
    second.expect("ADD-DEVICE OK").await;
    wait_attached(&registry, "panel").await;

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_duplicate_device_on_second_connection_is_rejected() {
    let (registry, addr, running) = start_hub().await;
    let mut first = Client::connect(addr).await;
    first.expect("BEGIN").await;
    first.send("ADD-DEVICE DEVICEID=panel").await;
    first.expect("ADD-DEVICE OK").await;
    wait_attached(&registry, "panel").await;

    let mut second = Client::connect(addr).await;
    second.expect("BEGIN").await;
    second.send("ADD-DEVICE DEVICEID=panel").await;

    let reply = second.expect("ADD-DEVICE ERROR").await;
    assert!(reply.contains("DEVICEID=panel"));
    assert_eq!(registry.len(), 1);

    running.store(false, Ordering::SeqCst);
}
