//! Network infrastructure for the hub.
//!
//! # Sub-modules
//!
//! - **`satellite_server`** – The Satellite TCP listener.  Accepts client
//!   connections, greets them with `BEGIN`, feeds every inbound line to a
//!   [`SatelliteConnection`] and writes its replies back.  A connection that
//!   stays silent longer than the heartbeat timeout is dropped, which removes
//!   every device it added.
//!
//! [`SatelliteConnection`]: crate::application::satellite_connection::SatelliteConnection

pub mod satellite_server;
