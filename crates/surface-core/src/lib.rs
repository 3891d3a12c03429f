//! # surface-core
//!
//! Shared library for SurfaceHub containing the panel geometry helpers, the
//! draw/config data model, the Satellite line protocol codec, and the byte
//! level codecs for the USB panels the hub talks to directly.
//!
//! This crate is used by the hub and by the WebSocket bridge.
//! It has zero dependencies on sockets, async runtimes, or HID libraries.
//!
//! # Architecture overview (for beginners)
//!
//! SurfaceHub drives control surfaces: grids of LCD keys, LED-backlit
//! keypads, rotary encoders, and remote "Satellite" clients that behave like
//! a panel but live on another machine.  The hub pushes finished button
//! images to those panels and turns their presses back into events.
//!
//! This crate (`surface-core`) is the pure foundation.  It defines:
//!
//! - **`domain`** – The grid model (`GridSize`, linear index <-> (x, y),
//!   rotations), the draw model (`PixelBuffer`, `ButtonStyle`, `DrawItem`),
//!   panel metadata, and the configuration-field schema every driver declares.
//!
//! - **`imaging`** – Device-specific pixel work: scaling and rotating a
//!   rendered button into a device's native size, and fitting a JPEG under a
//!   hard byte budget.
//!
//! - **`protocol`** – Wire formats.  The Satellite text protocol (one command
//!   per line, `KEY=value` parameters), the Satellite layout manifest, and the
//!   fixed-size HID packet formats of the Stream Dock and LED keypad families.

pub mod domain;
pub mod imaging;
pub mod protocol;

pub use domain::config::{ConfigField, FamilyConfig, PanelConfig};
pub use domain::draw::{ButtonKind, ButtonStyle, ColorMode, DrawItem, PixelBuffer, PixelFormat, RenderedImage, Rgb};
pub use domain::grid::{index_from_xy, xy_from_index, CellKey, GridSize, Rotation};
pub use domain::panel_info::{FirmwareUpdateInfo, PanelCapabilities, PanelInfo};
pub use protocol::satellite::{ProtocolError, SatelliteCommand, SatelliteMessage};
