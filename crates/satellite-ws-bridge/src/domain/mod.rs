//! Domain layer for satellite-ws-bridge.
//!
//! Only plain configuration lives here; nothing in this layer touches a
//! socket or reads the environment.

pub mod config;

pub use config::BridgeConfig;
