//! The draw model: what a driver receives when a button must be repainted.
//!
//! Rendering a button's visual style into pixels happens elsewhere.  Drivers
//! only see the finished [`PixelBuffer`] together with the [`ButtonStyle`] it
//! was rendered from, because some panels (LED keypads, remote clients that
//! draw their own text) want the style instead of, or as well as, pixels.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing draw types.
#[derive(Debug, Error, PartialEq)]
pub enum DrawError {
    #[error("pixel buffer length {actual} does not match {width}x{height} {format:?} (expected {expected})")]
    BufferSizeMismatch {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Channel layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb,
    Rgba,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// An immutable, cheaply clonable pixel buffer.
///
/// The data is shared behind an `Arc` so queueing the same frame for several
/// controls never copies pixels.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Arc<[u8]>,
}

impl PixelBuffer {
    /// Wraps `data` after checking that its length matches the dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`DrawError::BufferSizeMismatch`] when the length is wrong.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self, DrawError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(DrawError::BufferSizeMismatch {
                width,
                height,
                format,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data: data.into(),
        })
    }

    /// A buffer filled with one colour.
    pub fn solid(width: u32, height: u32, color: Rgb) -> Self {
        let data: Vec<u8> = std::iter::repeat([color.r, color.g, color.b])
            .take(width as usize * height as usize)
            .flatten()
            .collect();
        Self {
            width,
            height,
            format: PixelFormat::Rgb,
            data: data.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ── Colours ──────────────────────────────────────────────────────────────────

/// 24-bit colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpacks a `0xRRGGBB` integer.
    pub const fn from_u32(value: u32) -> Self {
        Self::new((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }

    /// Renders the colour the way a remote client negotiated it.
    pub fn format(&self, mode: ColorMode) -> String {
        match mode {
            ColorMode::Hex => format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b),
            ColorMode::Rgb => format!("rgb({},{},{})", self.r, self.g, self.b),
        }
    }
}

/// How colours are spelled on the Satellite wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Hex,
    Rgb,
}

// ── Style ────────────────────────────────────────────────────────────────────

/// Semantic tag for special buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonKind {
    #[default]
    Button,
    PageUp,
    PageDown,
    PageNumber,
}

impl ButtonKind {
    /// Name used in the Satellite `TYPE=` parameter.
    pub const fn wire_name(self) -> &'static str {
        match self {
            ButtonKind::Button => "BUTTON",
            ButtonKind::PageUp => "PAGEUP",
            ButtonKind::PageDown => "PAGEDOWN",
            ButtonKind::PageNumber => "PAGENUM",
        }
    }
}

/// Style metadata that travels alongside the rendered pixels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ButtonStyle {
    pub background_color: Rgb,
    pub text: Option<String>,
    pub text_color: Rgb,
    /// Font size in points; `None` means "auto".
    pub font_size: Option<u32>,
    pub kind: ButtonKind,
    pub pressed: bool,
}

/// A rendered button: pixels plus the style they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub pixels: PixelBuffer,
    pub style: ButtonStyle,
}

impl RenderedImage {
    pub fn new(pixels: PixelBuffer, style: ButtonStyle) -> Self {
        Self { pixels, style }
    }

    /// A fully black image with a default style, used to blank a key.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(PixelBuffer::solid(width, height, Rgb::BLACK), ButtonStyle::default())
    }
}

/// One redraw request for the control at `(x, y)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawItem {
    pub x: u32,
    pub y: u32,
    pub image: RenderedImage,
}

impl DrawItem {
    pub fn new(x: u32, y: u32, image: RenderedImage) -> Self {
        Self { x, y, image }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
