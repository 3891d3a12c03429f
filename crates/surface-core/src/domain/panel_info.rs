//! Static metadata a driver publishes about its panel.

use serde::{Deserialize, Serialize};

use crate::domain::config::ConfigField;

/// Optional features a panel supports beyond drawing and input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PanelCapabilities {
    pub brightness: bool,
    pub rotation: bool,
    /// The panel renders a pincode lock screen itself.
    pub pincode_lock: bool,
    /// The panel exchanges variable values with the host.
    pub variables: bool,
}

/// Where to fetch newer firmware for this panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareUpdateInfo {
    pub url: String,
}

/// Metadata owned by the driver instance.
///
/// Only the driver mutates it, for example once a serial number becomes
/// available after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelInfo {
    /// Human-readable product family, e.g. `"Stream Dock N4"`.
    pub type_name: String,
    pub description: String,
    /// Opaque identifier (serial number, HID path, Satellite device id).
    pub device_id: String,
    pub config_fields: Vec<ConfigField>,
    pub capabilities: PanelCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_update: Option<FirmwareUpdateInfo>,
}

impl PanelInfo {
    pub fn new(type_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            description: type_name.clone(),
            type_name,
            device_id: device_id.into(),
            config_fields: Vec::new(),
            capabilities: PanelCapabilities::default(),
            location: None,
            firmware_update: None,
        }
    }
}
