//! Satellite line protocol codec.
//!
//! Satellite lets a panel live in another process or on another machine.
//! Client and hub exchange newline-terminated ASCII lines:
//!
//! ```text
//! COMMAND-NAME KEY=value KEY="quoted value" FLAG
//! ```
//!
//! - Parameters are space delimited.  A bare `FLAG` means `FLAG=true`.
//! - Values containing spaces or quotes are double-quoted with backslash
//!   escapes.
//! - Binary payloads (bitmaps, text, variable values) are base64 inline.
//! - Unknown parameters are ignored so older parsers keep working when newer
//!   clients add fields.
//!
//! This module only converts between lines and typed values.  Sessions,
//! sockets and timeouts live in the hub.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::draw::{ButtonKind, ColorMode};
use crate::domain::grid::CellKey;
use crate::protocol::manifest::{BitmapSize, LayoutManifest, StyleCapabilities, MAX_BITMAP_EDGE};

/// Version of the Satellite API implemented by the hub.
pub const SATELLITE_API_VERSION: &str = "1.8.0";

/// Default TCP port of the Satellite listener.
pub const DEFAULT_SATELLITE_PORT: u16 = 16622;

/// Bitmap edge length used when a legacy client sends `BITMAPS=true`.
pub const DEFAULT_BITMAP_SIZE: u32 = 72;

/// Errors produced while parsing an inbound line.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty line")]
    EmptyLine,

    #[error("unterminated quoted value for parameter {0}")]
    UnterminatedQuote(String),

    #[error("{command}: missing parameter {name}")]
    MissingParameter { command: String, name: String },

    #[error("{command}: invalid {name}={value:?}: {reason}")]
    InvalidParameter {
        command: String,
        name: String,
        value: String,
        reason: String,
    },
}

// ── Parameter parsing ─────────────────────────────────────────────────────────

/// Parameters of one line, keyed by their (case-preserved) name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    command: String,
    values: HashMap<String, String>,
}

impl Params {
    /// Raw value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Value of `name`, or [`ProtocolError::MissingParameter`].
    pub fn required(&self, name: &str) -> Result<&str, ProtocolError> {
        self.get(name).ok_or_else(|| ProtocolError::MissingParameter {
            command: self.command.clone(),
            name: name.to_string(),
        })
    }

    /// Boolean value (`true`/`false`/`1`/`0`), `None` when absent.
    pub fn bool(&self, name: &str) -> Result<Option<bool>, ProtocolError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => parse_bool(v).map(Some).ok_or_else(|| self.invalid(name, v, "expected a boolean")),
        }
    }

    /// Decimal number, `None` when absent.
    pub fn number<T: FromStr>(&self, name: &str) -> Result<Option<T>, ProtocolError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|_| self.invalid(name, v, "expected a decimal number")),
        }
    }

    /// Base64 value decoded as UTF-8 text.
    pub fn base64_text(&self, name: &str) -> Result<Option<String>, ProtocolError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => {
                let bytes = BASE64.decode(v).map_err(|e| self.invalid(name, v, &e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| self.invalid(name, v, "not valid UTF-8"))
            }
        }
    }

    fn invalid(&self, name: &str, value: &str, reason: &str) -> ProtocolError {
        ProtocolError::InvalidParameter {
            command: self.command.clone(),
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Splits a line into its command name and the raw remainder.
fn split_command(line: &str) -> Result<(&str, &str), ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    Ok(match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim_start()),
        None => (line, ""),
    })
}

/// Parses a line into its command name and parameters.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyLine`] for blank input and
/// [`ProtocolError::UnterminatedQuote`] when a quoted value never closes.
///
/// # Examples
///
/// ```rust
/// use surface_core::protocol::satellite::parse_line;
///
/// let (command, params) = parse_line(r#"KEY-PRESS DEVICEID=abc KEY=3 PRESSED=1"#).unwrap();
/// assert_eq!(command, "KEY-PRESS");
/// assert_eq!(params.get("KEY"), Some("3"));
/// ```
pub fn parse_line(line: &str) -> Result<(String, Params), ProtocolError> {
    let (command, rest) = split_command(line)?;
    let mut params = Params {
        command: command.to_string(),
        values: HashMap::new(),
    };

    let mut chars = rest.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=') {
            key.push(c);
        }

        let value = if chars.next_if_eq(&'=').is_some() {
            if chars.next_if_eq(&'"').is_some() {
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(ProtocolError::UnterminatedQuote(key));
                }
                value
            } else {
                let mut value = String::new();
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
                value
            }
        } else {
            "true".to_string()
        };

        if !key.is_empty() {
            params.values.insert(key, value);
        }
    }

    Ok((params.command.clone(), params))
}

// ── Inbound commands ──────────────────────────────────────────────────────────

/// How a client addresses one of its controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    /// Legacy row-major key index.
    Key(u32),
    /// `KEY=row/column` form.
    Cell(CellKey),
    /// Manifest control id.
    ControlId(String),
}

/// Whether a declared variable flows from the device or to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableDirection {
    /// Device -> host custom variable.
    Input,
    /// Host expression -> device.
    Output,
}

/// One entry of the `VARIABLES` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariableDeclaration {
    pub id: String,
    #[serde(rename = "type")]
    pub direction: VariableDirection,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Parsed `ADD-DEVICE` handshake.
#[derive(Debug, Clone)]
pub struct AddDeviceRequest {
    pub device_id: String,
    pub product_name: String,
    pub keys_total: u32,
    pub keys_per_row: u32,
    pub bitmap_size: Option<u32>,
    pub color_mode: Option<ColorMode>,
    pub text: bool,
    pub text_style: bool,
    pub brightness: bool,
    pub pincode_lock: bool,
    pub variables: Vec<VariableDeclaration>,
    pub layout_manifest: Option<LayoutManifest>,
}

impl AddDeviceRequest {
    /// Capabilities every key shares in legacy (manifest-less) mode.
    pub fn legacy_style(&self) -> StyleCapabilities {
        StyleCapabilities {
            bitmap: self.bitmap_size.map(|s| BitmapSize { w: s, h: s }),
            colors: self.color_mode,
            text: self.text,
            text_style: self.text_style,
        }
    }
}

/// A command received from a Satellite client.
#[derive(Debug, Clone)]
pub enum SatelliteCommand {
    Ping(String),
    Pong(String),
    Quit,
    AddDevice(Box<AddDeviceRequest>),
    RemoveDevice {
        device_id: String,
    },
    KeyPress {
        device_id: String,
        control: ControlAddress,
        pressed: bool,
    },
    KeyRotate {
        device_id: String,
        control: ControlAddress,
        clockwise: bool,
    },
    PincodeKey {
        device_id: String,
        digit: u8,
    },
    SetVariableValue {
        device_id: String,
        variable: String,
        value: String,
    },
    Unknown {
        name: String,
    },
}

impl SatelliteCommand {
    /// Device the command is addressed to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            SatelliteCommand::AddDevice(req) => Some(&req.device_id),
            SatelliteCommand::RemoveDevice { device_id }
            | SatelliteCommand::KeyPress { device_id, .. }
            | SatelliteCommand::KeyRotate { device_id, .. }
            | SatelliteCommand::PincodeKey { device_id, .. }
            | SatelliteCommand::SetVariableValue { device_id, .. } => Some(device_id),
            _ => None,
        }
    }
}

/// Parses one inbound line into a [`SatelliteCommand`].
///
/// # Errors
///
/// Returns [`ProtocolError`] for blank lines, broken quoting, and missing or
/// malformed parameters of known commands.  Unknown command names are not an
/// error; they parse to [`SatelliteCommand::Unknown`].
pub fn parse_command(line: &str) -> Result<SatelliteCommand, ProtocolError> {
    let (name, rest) = split_command(line)?;
    match name {
        "PING" => return Ok(SatelliteCommand::Ping(rest.to_string())),
        "PONG" => return Ok(SatelliteCommand::Pong(rest.to_string())),
        "QUIT" => return Ok(SatelliteCommand::Quit),
        _ => {}
    }

    let (name, params) = parse_line(line)?;
    let device_id = || params.required("DEVICEID").map(str::to_string);

    let command = match name.as_str() {
        "ADD-DEVICE" => SatelliteCommand::AddDevice(Box::new(parse_add_device(&params)?)),
        "REMOVE-DEVICE" => SatelliteCommand::RemoveDevice { device_id: device_id()? },
        "KEY-PRESS" => SatelliteCommand::KeyPress {
            device_id: device_id()?,
            control: parse_control_address(&params)?,
            pressed: params
                .bool("PRESSED")?
                .ok_or_else(|| missing(&params, "PRESSED"))?,
        },
        "KEY-ROTATE" => {
            let direction = params.required("DIRECTION")?;
            let clockwise = match direction {
                "1" | "true" => true,
                "0" | "-1" | "false" => false,
                other => return Err(params.invalid("DIRECTION", other, "expected 1 or 0")),
            };
            SatelliteCommand::KeyRotate {
                device_id: device_id()?,
                control: parse_control_address(&params)?,
                clockwise,
            }
        }
        "PINCODE-KEY" => {
            let digit: u8 = params.number("KEY")?.ok_or_else(|| missing(&params, "KEY"))?;
            if digit > 9 {
                return Err(params.invalid("KEY", &digit.to_string(), "expected a single digit"));
            }
            SatelliteCommand::PincodeKey {
                device_id: device_id()?,
                digit,
            }
        }
        "SET-VARIABLE-VALUE" => SatelliteCommand::SetVariableValue {
            device_id: device_id()?,
            variable: params.required("VARIABLE")?.to_string(),
            value: params.base64_text("VALUE")?.unwrap_or_default(),
        },
        _ => SatelliteCommand::Unknown { name },
    };
    Ok(command)
}

fn missing(params: &Params, name: &str) -> ProtocolError {
    ProtocolError::MissingParameter {
        command: params.command.clone(),
        name: name.to_string(),
    }
}

fn parse_control_address(params: &Params) -> Result<ControlAddress, ProtocolError> {
    if let Some(id) = params.get("CONTROLID") {
        return Ok(ControlAddress::ControlId(id.to_string()));
    }
    let key = params.required("KEY")?;
    if let Some((row, column)) = key.split_once('/') {
        return match (row.parse(), column.parse()) {
            (Ok(row), Ok(column)) => Ok(ControlAddress::Cell(CellKey::new(row, column))),
            _ => Err(params.invalid("KEY", key, "expected row/column")),
        };
    }
    key.parse()
        .map(ControlAddress::Key)
        .map_err(|_| params.invalid("KEY", key, "expected a key index"))
}

fn parse_add_device(params: &Params) -> Result<AddDeviceRequest, ProtocolError> {
    let device_id = params.required("DEVICEID")?.to_string();
    let keys_per_row: u32 = params.number("KEYS_PER_ROW")?.unwrap_or(8);
    if keys_per_row == 0 {
        return Err(params.invalid("KEYS_PER_ROW", "0", "must be at least 1"));
    }

    let bitmap_size = match params.get("BITMAPS") {
        None => Some(DEFAULT_BITMAP_SIZE),
        Some(v) => match parse_bool(v) {
            Some(true) => Some(DEFAULT_BITMAP_SIZE),
            Some(false) => None,
            None => {
                let size: u32 = v.parse().map_err(|_| params.invalid("BITMAPS", v, "expected a boolean or size"))?;
                if size > MAX_BITMAP_EDGE {
                    return Err(params.invalid("BITMAPS", v, "exceeds the 1024 pixel limit"));
                }
                (size > 0).then_some(size)
            }
        },
    };

    let color_mode = match params.get("COLORS") {
        None => None,
        Some("hex") => Some(ColorMode::Hex),
        Some("rgb") => Some(ColorMode::Rgb),
        Some(v) => match parse_bool(v) {
            Some(true) => Some(ColorMode::Hex),
            Some(false) => None,
            None => return Err(params.invalid("COLORS", v, "expected hex, rgb or a boolean")),
        },
    };

    let pincode_lock = match params.get("PINCODE_LOCK") {
        None => false,
        Some(v) => parse_bool(v).unwrap_or(!v.is_empty()),
    };

    let variables = match params.base64_text("VARIABLES")? {
        None => Vec::new(),
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| params.invalid("VARIABLES", &json, &e.to_string()))?,
    };

    let layout_manifest = match params.get("LAYOUT_MANIFEST") {
        None => None,
        Some(v) => Some(
            LayoutManifest::from_base64(v).map_err(|e| params.invalid("LAYOUT_MANIFEST", v, &e.to_string()))?,
        ),
    };

    Ok(AddDeviceRequest {
        product_name: params.get("PRODUCT_NAME").unwrap_or("Satellite Device").to_string(),
        device_id,
        keys_total: params.number("KEYS_TOTAL")?.unwrap_or(32),
        keys_per_row,
        bitmap_size,
        color_mode,
        text: params.bool("TEXT")?.unwrap_or(false),
        text_style: params.bool("TEXT_STYLE")?.unwrap_or(false),
        brightness: params.bool("BRIGHTNESS")?.unwrap_or(true),
        pincode_lock,
        variables,
        layout_manifest,
    })
}

// ── Outbound messages ─────────────────────────────────────────────────────────

/// One `KEY-STATE` update.  Optional fields are only present when the target
/// control's style supports them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyState {
    pub device_id: String,
    pub control: Option<ControlAddress>,
    pub kind: ButtonKind,
    pub pressed: bool,
    /// Raw 24-bit RGB pixels, base64 encoded on the wire.
    pub bitmap: Option<Vec<u8>>,
    pub color: Option<String>,
    pub text_color: Option<String>,
    /// Plain text, base64 encoded on the wire.
    pub text: Option<String>,
    pub font_size: Option<String>,
}

/// A line sent from the hub to a Satellite client.
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteMessage {
    Begin {
        companion_version: String,
        api_version: String,
    },
    Pong(String),
    AddDeviceOk {
        device_id: String,
    },
    AddDeviceError {
        device_id: String,
        message: String,
    },
    RemoveDeviceOk {
        device_id: String,
    },
    KeyState(Box<KeyState>),
    KeysClear {
        device_id: String,
    },
    Brightness {
        device_id: String,
        value: u8,
    },
    LockedState {
        device_id: String,
        locked: bool,
        character_count: usize,
    },
    VariableValue {
        device_id: String,
        variable: String,
        value: String,
    },
    Error {
        message: String,
    },
}

/// Accumulates `KEY=value` pairs, quoting values when needed.
struct LineBuilder(String);

impl LineBuilder {
    fn new(command: &str) -> Self {
        Self(command.to_string())
    }

    fn param(mut self, key: &str, value: &str) -> Self {
        let needs_quotes = value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\');
        if needs_quotes {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            let _ = write!(self.0, " {key}=\"{escaped}\"");
        } else {
            let _ = write!(self.0, " {key}={value}");
        }
        self
    }

    fn param_if(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    fn finish(self) -> String {
        self.0
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl SatelliteMessage {
    /// Renders the message as one line without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            SatelliteMessage::Begin {
                companion_version,
                api_version,
            } => LineBuilder::new("BEGIN")
                .param("CompanionVersion", companion_version)
                .param("ApiVersion", api_version)
                .finish(),
            SatelliteMessage::Pong(payload) if payload.is_empty() => "PONG".to_string(),
            SatelliteMessage::Pong(payload) => format!("PONG {payload}"),
            SatelliteMessage::AddDeviceOk { device_id } => LineBuilder::new("ADD-DEVICE OK")
                .param("DEVICEID", device_id)
                .finish(),
            SatelliteMessage::AddDeviceError { device_id, message } => LineBuilder::new("ADD-DEVICE ERROR")
                .param("DEVICEID", device_id)
                .param("MESSAGE", message)
                .finish(),
            SatelliteMessage::RemoveDeviceOk { device_id } => LineBuilder::new("REMOVE-DEVICE OK")
                .param("DEVICEID", device_id)
                .finish(),
            SatelliteMessage::KeyState(state) => key_state_line(state),
            SatelliteMessage::KeysClear { device_id } => LineBuilder::new("KEYS-CLEAR")
                .param("DEVICEID", device_id)
                .finish(),
            SatelliteMessage::Brightness { device_id, value } => LineBuilder::new("BRIGHTNESS")
                .param("DEVICEID", device_id)
                .param("VALUE", &value.to_string())
                .finish(),
            SatelliteMessage::LockedState {
                device_id,
                locked,
                character_count,
            } => LineBuilder::new("LOCKED-STATE")
                .param("DEVICEID", device_id)
                .param("LOCKED", bool_str(*locked))
                .param("CHARACTER_COUNT", &character_count.to_string())
                .finish(),
            SatelliteMessage::VariableValue {
                device_id,
                variable,
                value,
            } => LineBuilder::new("VARIABLE-VALUE")
                .param("DEVICEID", device_id)
                .param("VARIABLE", variable)
                .param("VALUE", &BASE64.encode(value))
                .finish(),
            SatelliteMessage::Error { message } => LineBuilder::new("ERROR").param("MESSAGE", message).finish(),
        }
    }
}

fn key_state_line(state: &KeyState) -> String {
    let mut line = LineBuilder::new("KEY-STATE").param("DEVICEID", &state.device_id);
    line = match &state.control {
        Some(ControlAddress::Key(index)) => line.param("KEY", &index.to_string()),
        Some(ControlAddress::Cell(cell)) => line.param("KEY", &cell.to_string()),
        Some(ControlAddress::ControlId(id)) => line.param("CONTROLID", id),
        None => line,
    };
    let bitmap = state.bitmap.as_ref().map(|b| BASE64.encode(b));
    let text = state.text.as_ref().map(|t| BASE64.encode(t));
    line.param("TYPE", state.kind.wire_name())
        .param_if("BITMAP", bitmap.as_deref())
        .param_if("COLOR", state.color.as_deref())
        .param_if("TEXTCOLOR", state.text_color.as_deref())
        .param_if("TEXT", text.as_deref())
        .param_if("FONT_SIZE", state.font_size.as_deref())
        .param("PRESSED", bool_str(state.pressed))
        .finish()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
