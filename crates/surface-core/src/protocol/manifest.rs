//! Satellite layout manifest.
//!
//! Newer Satellite clients describe their hardware with a JSON manifest
//! instead of a plain "N keys, M per row" declaration:
//!
//! ```json
//! {
//!   "stylePresets": {
//!     "default": { "bitmap": { "w": 72, "h": 72 }, "colors": "hex" },
//!     "led":     { "colors": "rgb" }
//!   },
//!   "controls": {
//!     "btn-0":  { "row": 0, "column": 0 },
//!     "ring-0": { "row": 0, "column": 0, "stylePreset": "led" }
//!   }
//! }
//! ```
//!
//! The manifest is resolved once per device into a [`ResolvedLayout`]: a map
//! from each grid cell to every control occupying it.  Several controls may
//! share a cell (a key and the LED ring around it), and a single draw to that
//! cell repaints all of them.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::domain::draw::ColorMode;
use crate::domain::grid::{CellKey, GridSize};

/// Name of the preset used when a control names none, or an unknown one.
pub const DEFAULT_STYLE_PRESET: &str = "default";

/// Largest bitmap edge, in pixels, a client may ask for.
pub const MAX_BITMAP_EDGE: u32 = 1024;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("style preset {preset}: bitmap {w}x{h} exceeds the 1024 pixel limit")]
    BitmapTooLarge { preset: String, w: u32, h: u32 },
}

// ── Manifest document ─────────────────────────────────────────────────────────

/// The manifest exactly as the client sent it.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutManifest {
    #[serde(rename = "stylePresets", default)]
    pub style_presets: HashMap<String, StylePreset>,
    #[serde(default)]
    pub controls: BTreeMap<String, ManifestControl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestControl {
    pub row: u32,
    pub column: u32,
    #[serde(rename = "stylePreset", default)]
    pub style_preset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StylePreset {
    #[serde(default)]
    pub bitmap: Option<BitmapSize>,
    #[serde(default)]
    pub colors: Option<ColorsSpec>,
    #[serde(default)]
    pub text: bool,
    #[serde(rename = "textStyle", default)]
    pub text_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BitmapSize {
    pub w: u32,
    pub h: u32,
}

impl BitmapSize {
    /// Both edges non-zero and at most [`MAX_BITMAP_EDGE`].
    pub fn is_drawable(&self) -> bool {
        (1..=MAX_BITMAP_EDGE).contains(&self.w) && (1..=MAX_BITMAP_EDGE).contains(&self.h)
    }
}

/// `"colors"` may be a boolean (hex when `true`) or an explicit mode.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum ColorsSpec {
    Flag(bool),
    Mode(ColorMode),
}

impl ColorsSpec {
    fn mode(self) -> Option<ColorMode> {
        match self {
            ColorsSpec::Flag(true) => Some(ColorMode::Hex),
            ColorsSpec::Flag(false) => None,
            ColorsSpec::Mode(mode) => Some(mode),
        }
    }
}

// ── Resolved form ────────────────────────────────────────────────────────────

/// What a control can render.  Outbound `KEY-STATE` commands only carry the
/// parameters the control's capabilities allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StyleCapabilities {
    pub bitmap: Option<BitmapSize>,
    pub colors: Option<ColorMode>,
    pub text: bool,
    pub text_style: bool,
}

impl From<&StylePreset> for StyleCapabilities {
    fn from(preset: &StylePreset) -> Self {
        Self {
            bitmap: preset.bitmap.filter(BitmapSize::is_drawable),
            colors: preset.colors.and_then(ColorsSpec::mode),
            text: preset.text,
            text_style: preset.text_style,
        }
    }
}

/// One control after resolution.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDefinition {
    pub id: String,
    pub row: u32,
    pub column: u32,
    pub style: StyleCapabilities,
}

/// A manifest resolved into cell lookups.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLayout {
    grid: GridSize,
    by_cell: HashMap<CellKey, Vec<ControlDefinition>>,
    by_id: HashMap<String, CellKey>,
}

impl ResolvedLayout {
    /// Smallest grid containing every control.
    pub fn grid_size(&self) -> GridSize {
        self.grid
    }

    /// Every control at `(row, column)`; empty when the cell is unused.
    pub fn controls_at(&self, cell: CellKey) -> &[ControlDefinition] {
        self.by_cell.get(&cell).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cell of the control with `id`.
    pub fn cell_of(&self, id: &str) -> Option<CellKey> {
        self.by_id.get(id).copied()
    }

    pub fn control_count(&self) -> usize {
        self.by_id.len()
    }
}

impl LayoutManifest {
    /// Decodes the base64 `LAYOUT_MANIFEST` parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the value is not base64-encoded JSON of
    /// the expected shape.
    pub fn from_base64(value: &str) -> Result<Self, ManifestError> {
        let bytes = BASE64.decode(value.trim())?;
        let manifest: Self = serde_json::from_slice(&bytes)?;
        manifest.check_bitmap_sizes()?;
        Ok(manifest)
    }

    /// Rejects presets asking for bitmaps larger than [`MAX_BITMAP_EDGE`].
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::BitmapTooLarge`] for the first such preset.
    pub fn check_bitmap_sizes(&self) -> Result<(), ManifestError> {
        let mut names: Vec<&String> = self.style_presets.keys().collect();
        names.sort();
        for name in names {
            if let Some(BitmapSize { w, h }) = self.style_presets[name].bitmap {
                if w > MAX_BITMAP_EDGE || h > MAX_BITMAP_EDGE {
                    return Err(ManifestError::BitmapTooLarge {
                        preset: name.clone(),
                        w,
                        h,
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds the per-cell lookup.
    ///
    /// Controls naming no preset use `"default"`.  A control naming a preset
    /// that does not exist also falls back to `"default"`; when that is
    /// missing too the control gets no visual capabilities.
    pub fn resolve(&self) -> ResolvedLayout {
        let fallback = self
            .style_presets
            .get(DEFAULT_STYLE_PRESET)
            .map(StyleCapabilities::from)
            .unwrap_or_default();

        let mut layout = ResolvedLayout::default();
        for (id, control) in &self.controls {
            let preset_name = control.style_preset.as_deref().unwrap_or(DEFAULT_STYLE_PRESET);
            let style = match self.style_presets.get(preset_name) {
                Some(preset) => StyleCapabilities::from(preset),
                None => {
                    if preset_name != DEFAULT_STYLE_PRESET {
                        warn!("control {id} references unknown style preset {preset_name}");
                    }
                    fallback
                }
            };

            let cell = CellKey::new(control.row, control.column);
            layout.grid.columns = layout.grid.columns.max(control.column.saturating_add(1));
            layout.grid.rows = layout.grid.rows.max(control.row.saturating_add(1));
            layout.by_id.insert(id.clone(), cell);
            layout.by_cell.entry(cell).or_default().push(ControlDefinition {
                id: id.clone(),
                row: control.row,
                column: control.column,
                style,
            });
        }
        layout
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
