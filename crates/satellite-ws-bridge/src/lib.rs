//! satellite-ws-bridge library crate.
//!
//! Browser-based and other WebSocket-only Satellite clients cannot open a raw
//! TCP socket.  This crate accepts them on a WebSocket port and relays the
//! Satellite line protocol, unchanged, to the hub's TCP listener.
//!
//! # Architecture
//!
//! ```text
//! Satellite client (text frames over WebSocket)
//!         ↕
//! [satellite-ws-bridge]
//!   ├── domain/           BridgeConfig
//!   ├── application/      Frame ↔ line relay rules, keepalive filtering
//!   └── infrastructure/
//!         ├── ws_server/  WebSocket accept loop (tokio-tungstenite)
//!         └── hub_conn/   TCP connection to the hub's Satellite port
//!         ↕
//! surface-hub  (Satellite lines over TCP, port 16622)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O.
//! - `application` is pure string handling and is tested without sockets.
//! - `infrastructure` owns every socket and task.

/// Domain layer: configuration types.
pub mod domain;

/// Application layer: relay rules between frames and lines.
pub mod application;

/// Infrastructure layer: WebSocket server and hub TCP connection.
pub mod infrastructure;
