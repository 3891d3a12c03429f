//! Wire formats: the Satellite text protocol and the vendor HID packet codecs.

pub mod led_keypad;
pub mod manifest;
pub mod satellite;
pub mod stream_dock;

pub use manifest::{ControlDefinition, LayoutManifest, ManifestError, ResolvedLayout, StyleCapabilities};
pub use satellite::{
    parse_command, parse_line, AddDeviceRequest, ControlAddress, KeyState, Params, ProtocolError,
    SatelliteCommand, SatelliteMessage, VariableDeclaration, VariableDirection,
};
