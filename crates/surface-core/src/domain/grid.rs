//! Grid geometry shared by every driver.
//!
//! A panel exposes its controls as a rectangular grid of `columns x rows`
//! cells.  Vendors usually address keys by a linear index instead, so the
//! helpers here convert between the two.  All functions are pure and cheap
//! enough to call for every frame.
//!
//! # Coordinate convention
//!
//! `x` is the column (0 = left), `y` is the row (0 = top).  Linear indices are
//! row-major: index 0 is the top-left cell, index `columns - 1` is the
//! top-right cell, index `columns` is the first cell of the second row.
//!
//! ```text
//!   columns = 4, rows = 2
//!
//!   ┌───┬───┬───┬───┐
//!   │ 0 │ 1 │ 2 │ 3 │   y = 0
//!   ├───┼───┼───┼───┤
//!   │ 4 │ 5 │ 6 │ 7 │   y = 1
//!   └───┴───┴───┴───┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a panel's addressable grid.
///
/// A 0x0 grid is valid: some panels have no addressable buttons at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GridSize {
    pub columns: u32,
    pub rows: u32,
}

impl GridSize {
    pub const fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    /// Total number of addressable cells.
    pub fn cell_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Returns `true` if `(x, y)` lies inside the grid.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.columns && y < self.rows
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.columns, self.rows)
    }
}

/// Converts `(x, y)` into a row-major linear index.
///
/// Returns `None` when the coordinate lies outside `size`.
///
/// # Examples
///
/// ```rust
/// use surface_core::domain::grid::{index_from_xy, GridSize};
///
/// let size = GridSize::new(5, 3);
/// assert_eq!(index_from_xy(2, 1, size), Some(7));
/// assert_eq!(index_from_xy(5, 0, size), None);
/// ```
#[inline]
pub fn index_from_xy(x: u32, y: u32, size: GridSize) -> Option<usize> {
    if size.contains(x, y) {
        Some(y as usize * size.columns as usize + x as usize)
    } else {
        None
    }
}

/// Converts a row-major linear index back into `(x, y)`.
///
/// Returns `None` when `index` is beyond the last cell.
#[inline]
pub fn xy_from_index(index: usize, size: GridSize) -> Option<(u32, u32)> {
    if index >= size.cell_count() {
        return None;
    }
    let columns = size.columns as usize;
    Some(((index % columns) as u32, (index / columns) as u32))
}

// ── Rotation ─────────────────────────────────────────────────────────────────

/// One of the four right-angle rotations a panel can be mounted at.
///
/// Serialised as integer degrees (`0`, `90`, `-90`, `180`) to match the
/// rotation dropdown offered in panel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    CounterClockwise90,
    Rotate180,
}

impl Rotation {
    /// Signed degrees in the range `-90..=180`.
    pub const fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise90 => 90,
            Rotation::CounterClockwise90 => -90,
            Rotation::Rotate180 => 180,
        }
    }

    /// Builds a rotation from any multiple of 90 degrees (negative values and
    /// values beyond a full turn are normalised).
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        Some(Self::from_quarter_turns(degrees / 90))
    }

    /// Composes two rotations: `self` first, then `extra`.
    ///
    /// Used by drivers that apply a fixed hardware-mount rotation on top of the
    /// rotation the user configured.
    pub fn compose(self, extra: Rotation) -> Rotation {
        Self::from_quarter_turns(self.quarter_turns() + extra.quarter_turns())
    }

    fn quarter_turns(self) -> i32 {
        self.degrees() / 90
    }

    fn from_quarter_turns(turns: i32) -> Self {
        match turns.rem_euclid(4) {
            0 => Rotation::None,
            1 => Rotation::Clockwise90,
            2 => Rotation::Rotate180,
            _ => Rotation::CounterClockwise90,
        }
    }
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Rotation::from_degrees(value).ok_or_else(|| format!("invalid rotation: {value} degrees"))
    }
}

impl From<Rotation> for i32 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

// ── Cell key ─────────────────────────────────────────────────────────────────

/// Typed `(row, column)` key used for per-coordinate lookups.
///
/// Renders as the canonical `"row/column"` string in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub row: u32,
    pub column: u32,
}

impl CellKey {
    pub const fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.row, self.column)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
