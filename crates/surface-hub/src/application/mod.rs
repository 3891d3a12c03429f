//! Application layer of the hub.
//!
//! # What lives here? (for beginners)
//!
//! Everything that decides *what* happens, with no knowledge of *how* bytes
//! reach a device.  No HID calls, no sockets, no file system access.  The
//! infrastructure layer plugs concrete devices and transports into the
//! traits defined here.
//!
//! # Sub-modules
//!
//! - **`coalescing_queue`** – The keyed latest-value queue every driver uses
//!   to survive redraw storms.
//!
//! - **`panel`** – The Panel Contract (`SurfacePanel`), the typed event
//!   channel drivers push input through, and the `SurfaceSink` seam.
//!
//! - **`manage_surfaces`** – `SurfaceRegistry`, the in-memory table of
//!   attached panels.
//!
//! - **`satellite_session`** / **`satellite_connection`** – The remote
//!   Satellite device as a panel, and the per-connection command dispatcher.
//!
//! - **`variable_bridge`** / **`host_variables`** – Output-variable bridging
//!   and the small template evaluator the hub binary uses.

pub mod coalescing_queue;
pub mod host_variables;
pub mod manage_surfaces;
pub mod panel;
pub mod satellite_connection;
pub mod satellite_session;
pub mod variable_bridge;
