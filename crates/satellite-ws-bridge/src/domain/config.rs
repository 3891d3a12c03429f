//! Bridge configuration types.
//!
//! [`BridgeConfig`] holds every runtime setting.  `main.rs` builds it from the
//! command line; tests build it directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use surface_core::protocol::satellite::DEFAULT_SATELLITE_PORT;

/// Default WebSocket listener port, one above the hub's TCP port.
pub const DEFAULT_WS_PORT: u16 = DEFAULT_SATELLITE_PORT + 1;

/// Default keepalive interval.  Must stay below the hub's heartbeat timeout.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);

/// All runtime configuration for the WebSocket bridge.
///
/// # Example
///
/// ```rust
/// use satellite_ws_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 16623);
/// assert_eq!(cfg.hub_addr.port(), 16622);
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the WebSocket server binds to.
    pub ws_bind_addr: SocketAddr,

    /// The hub's Satellite TCP listener.
    pub hub_addr: SocketAddr,

    /// How often the bridge sends its own `PING` to the hub.
    ///
    /// A WebSocket client that only speaks when a key is pressed would
    /// otherwise trip the hub's heartbeat timeout between presses.
    pub ping_interval: Duration,
}

impl Default for BridgeConfig {
    /// | Field         | Default           |
    /// |---------------|-------------------|
    /// | ws_bind_addr  | `0.0.0.0:16623`   |
    /// | hub_addr      | `127.0.0.1:16622` |
    /// | ping_interval | 2 seconds         |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_WS_PORT),
            hub_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SATELLITE_PORT),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ws_port_is_16623() {
        // Arrange / Act
        let cfg = BridgeConfig::default();
        // Assert
        assert_eq!(cfg.ws_bind_addr.port(), 16623);
    }

    #[test]
    fn test_default_hub_is_local_satellite_port() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.hub_addr.to_string(), "127.0.0.1:16622");
    }

    #[test]
    fn test_default_ping_interval_is_below_hub_heartbeat() {
        let cfg = BridgeConfig::default();
        assert!(cfg.ping_interval < Duration::from_secs(5));
    }
}
