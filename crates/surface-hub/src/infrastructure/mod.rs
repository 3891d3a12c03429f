//! Infrastructure layer for the hub.
//!
//! Contains OS-facing adapters: HID transports, the device drivers built on
//! them, the Satellite TCP listener, and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `surface_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod drivers;
pub mod hid;
pub mod network;
pub mod storage;
