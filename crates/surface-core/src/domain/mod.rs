//! Domain layer: pure types describing panels, what gets drawn on them, and
//! how they are configured.
//!
//! Nothing in here performs I/O.  Drivers in the hub compose these types with
//! a transport to talk to real hardware.

pub mod config;
pub mod draw;
pub mod grid;
pub mod panel_info;
