//! TOML-based configuration persistence for the hub.
//!
//! Reads and writes [`HubConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\SurfaceHub\config.toml`
//! - Linux:    `~/.config/surfacehub/config.toml`
//! - macOS:    `~/Library/Application Support/SurfaceHub/config.toml`
//!
//! Example:
//!
//! ```toml
//! [hub]
//! log_level = "debug"
//!
//! [satellite]
//! bind_address = "0.0.0.0"
//! tcp_port = 16622
//! heartbeat_timeout_secs = 5
//!
//! [[stream_docks]]
//! model = "n4"
//!
//! [[emulators]]
//! id = "emulator-1"
//! columns = 8
//! rows = 4
//! ```
//!
//! Every field has a serde default, so a partial file (or none at all) loads.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use surface_core::protocol::led_keypad::KeypadModel;
use surface_core::protocol::satellite::DEFAULT_SATELLITE_PORT;
use surface_core::protocol::stream_dock::StreamDockModel;
use thiserror::Error;

use crate::infrastructure::network::satellite_server::SatelliteServerConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level hub configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub satellite: SatelliteSection,
    #[serde(default)]
    pub stream_docks: Vec<StreamDockEntry>,
    #[serde(default)]
    pub led_keypads: Vec<LedKeypadEntry>,
    #[serde(default)]
    pub emulators: Vec<EmulatorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Satellite listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SatelliteSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

/// A Stream Dock to open at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamDockEntry {
    pub model: StreamDockModel,
    /// HID path; when absent the first device with the model's USB ids is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// An LED keypad to open at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedKeypadEntry {
    pub model: KeypadModel,
    pub path: String,
}

/// An in-process emulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmulatorEntry {
    pub id: String,
    #[serde(default = "default_emulator_columns")]
    pub columns: u32,
    #[serde(default = "default_emulator_rows")]
    pub rows: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    DEFAULT_SATELLITE_PORT
}
fn default_heartbeat_timeout_secs() -> u64 {
    5
}
fn default_emulator_columns() -> u32 {
    8
}
fn default_emulator_rows() -> u32 {
    4
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for SatelliteSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl SatelliteSection {
    /// Listener settings derived from this section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if `bind_address` is not
    /// an IP address.
    pub fn server_config(&self, hub_version: &str) -> Result<SatelliteServerConfig, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;
        Ok(SatelliteServerConfig {
            bind_addr: SocketAddr::new(ip, self.tcp_port),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
            hub_version: hub_version.to_string(),
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot
/// be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(platform_config_dir()
        .ok_or(ConfigError::NoPlatformConfigDir)?
        .join("config.toml"))
}

/// Loads the config from the platform location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<HubConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config_to(config: &HubConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SurfaceHub"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("surfacehub"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("SurfaceHub")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
