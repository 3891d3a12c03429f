//! Infrastructure layer: every socket the bridge owns.
//!
//! - [`ws_server`] accepts WebSocket clients and runs one relay per session.
//! - [`hub_conn`] is the TCP side of a session, speaking plain lines.

pub mod hub_conn;
pub mod ws_server;

pub use ws_server::{run_server, WsBridgeServer};
