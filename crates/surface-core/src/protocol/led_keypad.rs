//! RGB backlit keypad HID protocol (X-keys style).
//!
//! Keys carry no screen, only an RGB backlight.  The firmware addresses keys
//! by a column-major control id: `id = column * rows + row`.
//!
//! ```text
//! Output report (36 bytes):
//!   [0x00 report id][command][args...][zero padding]
//!
//!   0xA5  backlight batch: [count][id r g b] x count   (count <= 8)
//!   0xB6  bank on/off:     [bank][state]
//!   0xBB  intensity:       [bank 0 level][bank 1 level]
//!
//! Input report:
//!   [unit id][flags][column 0 bits][column 1 bits]...   bit n = row n pressed
//! ```

use thiserror::Error;

use crate::domain::draw::Rgb;
use crate::domain::grid::GridSize;

/// Length of every HID write: report id + 35 payload bytes.
pub const REPORT_LEN: usize = 36;

pub const CMD_BACKLIGHT_BATCH: u8 = 0xA5;
pub const CMD_BANK_STATE: u8 = 0xB6;
pub const CMD_INTENSITY: u8 = 0xBB;

/// Key updates that fit in one batch report.
pub const MAX_BATCH: usize = 8;

/// Offset of the first column bitmask in an input report.
pub const INPUT_COLUMNS_OFFSET: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum KeypadReportError {
    #[error("input report too short: need {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },
}

/// Supported keypad models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeypadModel {
    /// 4 columns x 6 rows.
    Xk24,
    /// 10 columns x 8 rows.
    Xk80,
}

impl KeypadModel {
    pub const fn name(self) -> &'static str {
        match self {
            KeypadModel::Xk24 => "XK-24 RGB",
            KeypadModel::Xk80 => "XK-80 RGB",
        }
    }

    pub const fn grid_size(self) -> GridSize {
        match self {
            KeypadModel::Xk24 => GridSize::new(4, 6),
            KeypadModel::Xk80 => GridSize::new(10, 8),
        }
    }

    /// Column-major control id of `(column, row)`.
    pub fn control_id(self, column: u32, row: u32) -> Option<u8> {
        let grid = self.grid_size();
        grid.contains(column, row).then(|| (column * grid.rows + row) as u8)
    }

    /// Inverse of [`KeypadModel::control_id`].
    pub fn cell_of(self, control_id: u8) -> Option<(u32, u32)> {
        let grid = self.grid_size();
        let id = u32::from(control_id);
        (id < grid.columns * grid.rows).then(|| (id / grid.rows, id % grid.rows))
    }

    pub fn key_count(self) -> usize {
        self.grid_size().cell_count()
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

fn report(command: u8, args: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(REPORT_LEN);
    r.push(0x00);
    r.push(command);
    r.extend_from_slice(args);
    r.resize(REPORT_LEN, 0);
    r
}

/// Encodes backlight changes, `MAX_BATCH` keys per report.
pub fn backlight_reports(updates: &[(u8, Rgb)]) -> Vec<Vec<u8>> {
    updates
        .chunks(MAX_BATCH)
        .map(|chunk| {
            let mut args = Vec::with_capacity(1 + chunk.len() * 4);
            args.push(chunk.len() as u8);
            for (id, color) in chunk {
                args.extend_from_slice(&[*id, color.r, color.g, color.b]);
            }
            report(CMD_BACKLIGHT_BATCH, &args)
        })
        .collect()
}

/// Turns both backlight banks off.
pub fn all_off_reports() -> Vec<Vec<u8>> {
    vec![report(CMD_BANK_STATE, &[0, 0]), report(CMD_BANK_STATE, &[1, 0])]
}

/// Backlight intensity from a 0-100 brightness.
pub fn intensity_report(brightness: u8) -> Vec<u8> {
    let level = (u32::from(brightness.min(100)) * 255 / 100) as u8;
    report(CMD_INTENSITY, &[level, level])
}

// ── Input ────────────────────────────────────────────────────────────────────

/// Decodes the pressed-key bitmask into one flag per control id.
///
/// # Errors
///
/// Returns [`KeypadReportError::TooShort`] if the report lacks a column.
pub fn parse_key_states(model: KeypadModel, data: &[u8]) -> Result<Vec<bool>, KeypadReportError> {
    let grid = model.grid_size();
    let needed = INPUT_COLUMNS_OFFSET + grid.columns as usize;
    if data.len() < needed {
        return Err(KeypadReportError::TooShort {
            needed,
            available: data.len(),
        });
    }
    let mut states = vec![false; model.key_count()];
    for column in 0..grid.columns {
        let bits = data[INPUT_COLUMNS_OFFSET + column as usize];
        for row in 0..grid.rows {
            states[(column * grid.rows + row) as usize] = bits & (1 << row) != 0;
        }
    }
    Ok(states)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_id_is_column_major() {
        let m = KeypadModel::Xk24;
        assert_eq!(m.control_id(0, 0), Some(0));
        assert_eq!(m.control_id(0, 5), Some(5));
        assert_eq!(m.control_id(1, 0), Some(6));
        assert_eq!(m.control_id(3, 5), Some(23));
        assert_eq!(m.control_id(4, 0), None);
    }

    #[test]
    fn test_cell_of_inverts_control_id() {
        let m = KeypadModel::Xk80;
        for id in 0..m.key_count() as u8 {
            let (c, r) = m.cell_of(id).unwrap();
            assert_eq!(m.control_id(c, r), Some(id));
        }
        assert_eq!(m.cell_of(80), None);
    }

    #[test]
    fn test_backlight_reports_batch_eight_per_report() {
        // Arrange
        let updates: Vec<(u8, Rgb)> = (0..10).map(|i| (i, Rgb::new(i, 0, 255))).collect();

        // Act
        let reports = backlight_reports(&updates);

        // Assert
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.len() == REPORT_LEN));
        assert_eq!(reports[0][1], CMD_BACKLIGHT_BATCH);
        assert_eq!(reports[0][2], 8);
        assert_eq!(&reports[0][3..7], &[0, 0, 0, 255]);
        assert_eq!(reports[1][2], 2);
        assert_eq!(&reports[1][3..7], &[8, 8, 0, 255]);
    }

    #[test]
    fn test_intensity_scales_percent_to_byte() {
        assert_eq!(&intensity_report(100)[1..4], &[CMD_INTENSITY, 255, 255]);
        assert_eq!(intensity_report(0)[2], 0);
        assert_eq!(intensity_report(50)[2], 127);
    }

    #[test]
    fn test_parse_key_states_reads_column_bitmasks() {
        // Arrange: column 1, rows 0 and 2 pressed
        let mut data = vec![0u8; 32];
        data[INPUT_COLUMNS_OFFSET + 1] = 0b0000_0101;

        // Act
        let states = parse_key_states(KeypadModel::Xk24, &data).unwrap();

        // Assert
        let pressed: Vec<usize> = states.iter().enumerate().filter(|(_, p)| **p).map(|(i, _)| i).collect();
        assert_eq!(pressed, vec![6, 8]);
    }

    #[test]
    fn test_parse_key_states_rejects_short_report() {
        assert_eq!(
            parse_key_states(KeypadModel::Xk80, &[0u8; 5]),
            Err(KeypadReportError::TooShort { needed: 12, available: 5 })
        );
    }
}
