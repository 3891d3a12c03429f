//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the hub's TOML settings from the
//! platform-appropriate directory, falls back to defaults on first run, and
//! can write them back.  Per-panel settings (brightness, bindings) are not
//! stored here; they arrive through `set_config` at runtime.

pub mod config;
