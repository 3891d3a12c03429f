//! Panel configuration: the field schema drivers declare, and the typed
//! configuration value that is validated against it.
//!
//! # Schema vs. value
//!
//! Every driver publishes a list of [`ConfigField`]s in its `PanelInfo`.  The
//! settings UI renders those fields; the chosen values come back as a
//! [`PanelConfig`].  Before a driver applies a config it calls
//! [`PanelConfig::validated`], which clamps numbers into the declared bounds
//! and drops anything the schema does not declare.  Drivers therefore never
//! have to trust the caller.
//!
//! Fields that most panels share (offset, brightness, rotation, locking) are
//! provided as reusable fragments so drivers do not invent their own ids.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::grid::Rotation;

pub const FIELD_BRIGHTNESS: &str = "brightness";
pub const FIELD_ROTATION: &str = "rotation";
pub const FIELD_NEVER_LOCK: &str = "never_lock";
pub const FIELD_X_OFFSET: &str = "x_offset";
pub const FIELD_Y_OFFSET: &str = "y_offset";
pub const FIELD_EMULATOR_COLUMNS: &str = "emulator_columns";
pub const FIELD_EMULATOR_ROWS: &str = "emulator_rows";

/// One choice of a dropdown field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropdownChoice {
    pub id: String,
    pub label: String,
}

/// A configuration field descriptor.  The set of kinds is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConfigField {
    Number {
        id: String,
        label: String,
        min: i64,
        max: i64,
        step: i64,
        default: i64,
    },
    Checkbox {
        id: String,
        label: String,
        default: bool,
    },
    Dropdown {
        id: String,
        label: String,
        choices: Vec<DropdownChoice>,
        default: String,
    },
    Text {
        id: String,
        label: String,
        default: String,
        /// The value is a host expression rather than literal text.
        is_expression: bool,
    },
    /// Binds a panel value to a host custom variable.
    CustomVariable { id: String, label: String },
}

impl ConfigField {
    pub fn id(&self) -> &str {
        match self {
            ConfigField::Number { id, .. }
            | ConfigField::Checkbox { id, .. }
            | ConfigField::Dropdown { id, .. }
            | ConfigField::Text { id, .. }
            | ConfigField::CustomVariable { id, .. } => id,
        }
    }

    fn number(id: &str, label: &str, min: i64, max: i64, default: i64) -> Self {
        ConfigField::Number {
            id: id.to_string(),
            label: label.to_string(),
            min,
            max,
            step: 1,
            default,
        }
    }
}

// ── Shared fragments ─────────────────────────────────────────────────────────

/// Horizontal and vertical placement of the panel within the page grid.
pub fn offset_fields() -> Vec<ConfigField> {
    vec![
        ConfigField::number(FIELD_X_OFFSET, "Horizontal Offset in grid", 0, 10_000, 0),
        ConfigField::number(FIELD_Y_OFFSET, "Vertical Offset in grid", 0, 10_000, 0),
    ]
}

pub fn brightness_field() -> ConfigField {
    ConfigField::number(FIELD_BRIGHTNESS, "Brightness", 1, 100, 50)
}

pub fn rotation_field() -> ConfigField {
    let choice = |id: &str, label: &str| DropdownChoice {
        id: id.to_string(),
        label: label.to_string(),
    };
    ConfigField::Dropdown {
        id: FIELD_ROTATION.to_string(),
        label: "Button rotation".to_string(),
        choices: vec![
            choice("0", "Normal"),
            choice("-90", "90 CCW"),
            choice("90", "90 CW"),
            choice("180", "180"),
        ],
        default: "0".to_string(),
    }
}

pub fn lock_fields() -> Vec<ConfigField> {
    vec![ConfigField::Checkbox {
        id: FIELD_NEVER_LOCK.to_string(),
        label: "Never Pin code lock".to_string(),
        default: false,
    }]
}

/// Grid size fields of the in-process emulator.
pub fn emulator_fields() -> Vec<ConfigField> {
    vec![
        ConfigField::number(FIELD_EMULATOR_COLUMNS, "Columns", 1, 20, 8),
        ConfigField::number(FIELD_EMULATOR_ROWS, "Rows", 1, 20, 4),
    ]
}

/// Schema shared by every locally attached panel with an LCD grid.
pub fn lcd_panel_fields() -> Vec<ConfigField> {
    let mut fields = offset_fields();
    fields.push(brightness_field());
    fields.push(rotation_field());
    fields.extend(lock_fields());
    fields
}

// ── Config value ─────────────────────────────────────────────────────────────

/// Family-specific part of a [`PanelConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum FamilyConfig {
    StreamDock,
    LedKeypad,
    Emulator {
        columns: u32,
        rows: u32,
    },
    Satellite {
        /// Variable id -> custom variable name (inputs) or expression (outputs).
        #[serde(default)]
        bindings: BTreeMap<String, String>,
    },
}

/// Typed configuration applied through `set_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub never_lock: bool,
    #[serde(default)]
    pub x_offset: u32,
    #[serde(default)]
    pub y_offset: u32,
    #[serde(flatten)]
    pub family: FamilyConfig,
}

fn default_brightness() -> u8 {
    50
}

impl PanelConfig {
    /// Default values for the given family.
    pub fn new(family: FamilyConfig) -> Self {
        Self {
            brightness: default_brightness(),
            rotation: Rotation::None,
            never_lock: false,
            x_offset: 0,
            y_offset: 0,
            family,
        }
    }

    /// Returns a copy of `self` coerced into `schema`, plus every adjustment
    /// that had to be made.
    pub fn validated(&self, schema: &[ConfigField]) -> (PanelConfig, Vec<ConfigAdjustment>) {
        let mut out = self.clone();
        let mut adjustments = Vec::new();

        out.brightness = clamp_field(schema, FIELD_BRIGHTNESS, i64::from(self.brightness), &mut adjustments) as u8;
        out.x_offset = clamp_field(schema, FIELD_X_OFFSET, i64::from(self.x_offset), &mut adjustments) as u32;
        out.y_offset = clamp_field(schema, FIELD_Y_OFFSET, i64::from(self.y_offset), &mut adjustments) as u32;

        if self.rotation != Rotation::None && find_field(schema, FIELD_ROTATION).is_none() {
            adjustments.push(ConfigAdjustment::Dropped {
                field: FIELD_ROTATION.to_string(),
            });
            out.rotation = Rotation::None;
        }

        match &mut out.family {
            FamilyConfig::Emulator { columns, rows } => {
                *columns = clamp_field(schema, FIELD_EMULATOR_COLUMNS, i64::from(*columns), &mut adjustments) as u32;
                *rows = clamp_field(schema, FIELD_EMULATOR_ROWS, i64::from(*rows), &mut adjustments) as u32;
            }
            FamilyConfig::Satellite { bindings } => {
                bindings.retain(|id, _| {
                    let declared = matches!(
                        find_field(schema, id),
                        Some(ConfigField::CustomVariable { .. })
                            | Some(ConfigField::Text {
                                is_expression: true,
                                ..
                            })
                    );
                    if !declared {
                        adjustments.push(ConfigAdjustment::Dropped { field: id.clone() });
                    }
                    declared
                });
            }
            FamilyConfig::StreamDock | FamilyConfig::LedKeypad => {}
        }

        (out, adjustments)
    }
}

/// A change [`PanelConfig::validated`] made to the caller's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAdjustment {
    Clamped { field: String, from: i64, to: i64 },
    Dropped { field: String },
}

impl fmt::Display for ConfigAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigAdjustment::Clamped { field, from, to } => {
                write!(f, "{field}: {from} adjusted to {to}")
            }
            ConfigAdjustment::Dropped { field } => write!(f, "{field}: not declared, ignored"),
        }
    }
}

fn find_field<'a>(schema: &'a [ConfigField], id: &str) -> Option<&'a ConfigField> {
    schema.iter().find(|f| f.id() == id)
}

/// Clamps and step-snaps `value` against a declared number field.  Values for
/// fields the schema does not declare as numbers pass through untouched.
fn clamp_field(schema: &[ConfigField], id: &str, value: i64, adjustments: &mut Vec<ConfigAdjustment>) -> i64 {
    let Some(ConfigField::Number { min, max, step, .. }) = find_field(schema, id) else {
        return value;
    };
    let mut v = value.clamp(*min, *max);
    if *step > 1 {
        let steps = (v - min + step / 2) / step;
        v = (min + steps * step).clamp(*min, *max);
    }
    if v != value {
        adjustments.push(ConfigAdjustment::Clamped {
            field: id.to_string(),
            from: value,
            to: v,
        });
    }
    v
}

// ── Tests ─────────────────────────────────────────────────────────────────────
