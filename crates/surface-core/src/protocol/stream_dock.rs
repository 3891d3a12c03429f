//! Stream Dock raw HID protocol (Mirabox / AJAZZ firmware, protocol v3).
//!
//! These decks are driven without a vendor SDK: every command is a
//! fixed-size output report.
//!
//! ```text
//! Output report (1025 bytes):
//!   [0x00 report id][ "CRT\0\0" ][ 3-byte command ][ args ][ zero padding to 1024 ]
//!
//! Image upload:
//!   BAT header packet      CRT\0\0 BAT [size:u32 BE][display id]
//!   data packets           raw JPEG, 1024 bytes per packet, no prefix
//!   STP packet             commits the frame
//!
//! Input report:
//!   [ "ACK\0\0OK\0\0" ][ raw id ][ state ] ...
//! ```
//!
//! Exact byte offsets matter: the firmware is not under our control.

use thiserror::Error;

use crate::domain::grid::{GridSize, Rotation};

/// Payload bytes per packet, excluding the report id.
pub const PACKET_SIZE: usize = 1024;

/// Length of every HID write: report id + packet.
pub const REPORT_LEN: usize = PACKET_SIZE + 1;

pub const REPORT_ID: u8 = 0x00;

/// Prefix of every command packet.
pub const COMMAND_PREFIX: [u8; 5] = *b"CRT\0\0";

/// Header of every input report.
pub const ACK_HEADER: [u8; 9] = *b"ACK\0\0OK\0\0";

/// Byte offsets inside an input report.
pub const INPUT_ID_OFFSET: usize = 9;
pub const INPUT_STATE_OFFSET: usize = 10;

/// Maximum size of one key's JPEG.
pub const IMAGE_BYTE_BUDGET: usize = 10_240;

/// Size of an input report as read from the device.
pub const INPUT_REPORT_LEN: usize = 512;

/// Clear-target meaning "every key".
const CLEAR_ALL_TARGET: u8 = 0xff;

#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("input report too short: need {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },
}

// ── Output ───────────────────────────────────────────────────────────────────

/// A command the deck understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `DIS`: wake the screen.
    Wake,
    /// `LIG`: backlight in percent.
    Brightness(u8),
    /// `CLE` with target 0xff: blank everything.
    ClearAll,
    /// `BAT`: announce `size` bytes of JPEG for a display id.
    ImageHeader { display_id: u8, size: u32 },
    /// `STP`: commit pending image data.
    Flush,
    /// `HAN`: put the deck to sleep.
    Sleep,
}

impl Command {
    /// Command bytes that follow [`COMMAND_PREFIX`].
    pub fn body(&self) -> Vec<u8> {
        match *self {
            Command::Wake => b"DIS".to_vec(),
            Command::Brightness(percent) => {
                let mut v = b"LIG\0\0".to_vec();
                v.push(percent.min(100));
                v
            }
            Command::ClearAll => {
                let mut v = b"CLE\0\0\0".to_vec();
                v.push(CLEAR_ALL_TARGET);
                v
            }
            Command::ImageHeader { display_id, size } => {
                let mut v = b"BAT".to_vec();
                v.extend_from_slice(&size.to_be_bytes());
                v.push(display_id);
                v
            }
            Command::Flush => b"STP".to_vec(),
            Command::Sleep => b"HAN".to_vec(),
        }
    }

    /// The command framed into a single output report.
    pub fn to_report(&self) -> Vec<u8> {
        let mut body = COMMAND_PREFIX.to_vec();
        body.extend_from_slice(&self.body());
        // Command bodies are a handful of bytes, far below PACKET_SIZE.
        encode_packets(&body, &[]).swap_remove(0)
    }
}

/// Frames `prefix` followed by `payload` into output reports.
///
/// The first report carries the prefix and as much payload as fits; the rest
/// of the payload follows in reports with an empty prefix.  Every report is
/// exactly [`REPORT_LEN`] bytes, zero padded.  At least one report is always
/// produced.
///
/// # Examples
///
/// ```rust
/// use surface_core::protocol::stream_dock::{encode_packets, REPORT_LEN};
///
/// let reports = encode_packets(b"CRT\0\0STP", &[]);
/// assert_eq!(reports.len(), 1);
/// assert_eq!(reports[0].len(), REPORT_LEN);
/// assert_eq!(&reports[0][1..9], b"CRT\0\0STP");
/// ```
pub fn encode_packets(prefix: &[u8], payload: &[u8]) -> Vec<Vec<u8>> {
    let first_room = PACKET_SIZE.saturating_sub(prefix.len());
    let (head, tail) = payload.split_at(payload.len().min(first_room));

    let mut reports = Vec::with_capacity(1 + tail.len().div_ceil(PACKET_SIZE));
    reports.push(padded_report(&[&prefix[..prefix.len().min(PACKET_SIZE)], head]));
    for chunk in tail.chunks(PACKET_SIZE) {
        reports.push(padded_report(&[chunk]));
    }
    reports
}

fn padded_report(parts: &[&[u8]]) -> Vec<u8> {
    let mut report = Vec::with_capacity(REPORT_LEN);
    report.push(REPORT_ID);
    for part in parts {
        report.extend_from_slice(part);
    }
    report.resize(REPORT_LEN, 0);
    report
}

/// Every report needed to upload one JPEG to `display_id`, including the
/// trailing flush.
pub fn image_reports(display_id: u8, jpeg: &[u8]) -> Vec<Vec<u8>> {
    let mut reports = vec![Command::ImageHeader {
        display_id,
        size: jpeg.len() as u32,
    }
    .to_report()];
    if !jpeg.is_empty() {
        reports.extend(encode_packets(&[], jpeg));
    }
    reports.push(Command::Flush.to_report());
    reports
}

// ── Input ────────────────────────────────────────────────────────────────────

/// A raw input event pulled out of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInput {
    pub id: u8,
    pub state: u8,
}

/// Extracts the raw id and state from an input report.
///
/// Returns `Ok(None)` for reports that are not input acknowledgements.
///
/// # Errors
///
/// Returns [`PacketError::TooShort`] when the report is truncated.
pub fn parse_input_report(report: &[u8]) -> Result<Option<RawInput>, PacketError> {
    let needed = INPUT_STATE_OFFSET + 1;
    if report.len() < needed {
        return Err(PacketError::TooShort {
            needed,
            available: report.len(),
        });
    }
    if report[..ACK_HEADER.len()] != ACK_HEADER {
        return Ok(None);
    }
    Ok(Some(RawInput {
        id: report[INPUT_ID_OFFSET],
        state: report[INPUT_STATE_OFFSET],
    }))
}

/// Normalised action for a raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    Press { column: u32, row: u32 },
    Release { column: u32, row: u32 },
    RotateLeft { column: u32, row: u32 },
    RotateRight { column: u32, row: u32 },
    SwipeLeft { column: u32, row: u32 },
    SwipeRight { column: u32, row: u32 },
}

#[derive(Debug, Clone, Copy)]
enum InputKind {
    /// Press when state != 0, release otherwise.
    Button,
    TurnLeft,
    TurnRight,
    SwipeLeft,
    SwipeRight,
}

/// One row of a model's input table.
#[derive(Debug, Clone, Copy)]
struct InputMapping {
    raw_id: u8,
    column: u32,
    row: u32,
    kind: InputKind,
}

const fn button(raw_id: u8, column: u32, row: u32) -> InputMapping {
    InputMapping {
        raw_id,
        column,
        row,
        kind: InputKind::Button,
    }
}

const fn input(raw_id: u8, column: u32, row: u32, kind: InputKind) -> InputMapping {
    InputMapping { raw_id, column, row, kind }
}

const N4_INPUTS: &[InputMapping] = &[
    // LCD keys, top row then bottom row
    button(0x01, 0, 0),
    button(0x02, 1, 0),
    button(0x03, 2, 0),
    button(0x04, 3, 0),
    button(0x05, 4, 0),
    button(0x06, 0, 1),
    button(0x07, 1, 1),
    button(0x08, 2, 1),
    button(0x09, 3, 1),
    button(0x0a, 4, 1),
    // touch strip segments
    button(0x40, 0, 2),
    button(0x41, 1, 2),
    button(0x42, 2, 2),
    button(0x43, 3, 2),
    // strip swipes surface on the spare strip cell
    input(0x38, 4, 2, InputKind::SwipeLeft),
    input(0x39, 4, 2, InputKind::SwipeRight),
    // encoders: push, then left/right detents
    button(0x37, 0, 3),
    button(0x35, 1, 3),
    button(0x33, 2, 3),
    button(0x36, 3, 3),
    input(0xa0, 0, 3, InputKind::TurnLeft),
    input(0xa1, 0, 3, InputKind::TurnRight),
    input(0x50, 1, 3, InputKind::TurnLeft),
    input(0x51, 1, 3, InputKind::TurnRight),
    input(0x90, 2, 3, InputKind::TurnLeft),
    input(0x91, 2, 3, InputKind::TurnRight),
    input(0x70, 3, 3, InputKind::TurnLeft),
    input(0x71, 3, 3, InputKind::TurnRight),
];

const CLASSIC15_INPUTS: &[InputMapping] = &[
    button(0x01, 0, 0),
    button(0x02, 1, 0),
    button(0x03, 2, 0),
    button(0x04, 3, 0),
    button(0x05, 4, 0),
    button(0x06, 0, 1),
    button(0x07, 1, 1),
    button(0x08, 2, 1),
    button(0x09, 3, 1),
    button(0x0a, 4, 1),
    button(0x0b, 0, 2),
    button(0x0c, 1, 2),
    button(0x0d, 2, 2),
    button(0x0e, 3, 2),
    button(0x0f, 4, 2),
];

// ── Models ───────────────────────────────────────────────────────────────────

/// Supported deck models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamDockModel {
    /// 10 LCD keys, 4-segment touch strip, 4 encoders.
    N4,
    /// 15 LCD keys in a 5x3 grid.
    Classic15,
}

/// Where a grid cell's image goes on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySlot {
    /// 1-based display id used by `BAT` and `CLE`.
    pub display_id: u8,
    pub width: u32,
    pub height: u32,
}

impl StreamDockModel {
    pub const fn name(self) -> &'static str {
        match self {
            StreamDockModel::N4 => "Stream Dock N4",
            StreamDockModel::Classic15 => "Stream Dock 15",
        }
    }

    pub const fn usb_ids(self) -> (u16, u16) {
        match self {
            StreamDockModel::N4 => (0x0300, 0x3004),
            StreamDockModel::Classic15 => (0x0300, 0x1010),
        }
    }

    pub const fn grid_size(self) -> GridSize {
        match self {
            StreamDockModel::N4 => GridSize::new(5, 4),
            StreamDockModel::Classic15 => GridSize::new(5, 3),
        }
    }

    /// Rotation of the LCD panels relative to the case, applied on top of
    /// the user's rotation.
    pub const fn mount_rotation(self) -> Rotation {
        match self {
            StreamDockModel::N4 => Rotation::None,
            StreamDockModel::Classic15 => Rotation::Clockwise90,
        }
    }

    /// Display slot for the cell at `(column, row)`, `None` for cells without
    /// a screen (encoders, swipe target, out of range).
    pub fn display_slot(self, column: u32, row: u32) -> Option<DisplaySlot> {
        let slot = |display_id: u32, width, height| DisplaySlot {
            display_id: display_id as u8,
            width,
            height,
        };
        match self {
            StreamDockModel::N4 => match (row, column) {
                // the firmware numbers the bottom key row first
                (0, c @ 0..=4) => Some(slot(11 + c, 112, 112)),
                (1, c @ 0..=4) => Some(slot(6 + c, 112, 112)),
                (2, c @ 0..=3) => Some(slot(1 + c, 176, 112)),
                _ => None,
            },
            StreamDockModel::Classic15 => {
                if row < 3 && column < 5 {
                    Some(slot(row * 5 + column + 1, 85, 85))
                } else {
                    None
                }
            }
        }
    }

    /// Every display slot of the model, for clearing.
    pub fn display_slots(self) -> Vec<DisplaySlot> {
        let grid = self.grid_size();
        (0..grid.rows)
            .flat_map(|row| (0..grid.columns).map(move |column| (column, row)))
            .filter_map(|(column, row)| self.display_slot(column, row))
            .collect()
    }

    fn inputs(self) -> &'static [InputMapping] {
        match self {
            StreamDockModel::N4 => N4_INPUTS,
            StreamDockModel::Classic15 => CLASSIC15_INPUTS,
        }
    }

    /// Looks `raw` up in the model's input table.
    ///
    /// Unknown ids return `None`; callers log and drop them.
    pub fn decode_input(self, raw: RawInput) -> Option<InputAction> {
        let mapping = self.inputs().iter().find(|m| m.raw_id == raw.id)?;
        let (column, row) = (mapping.column, mapping.row);
        Some(match mapping.kind {
            InputKind::Button if raw.state != 0 => InputAction::Press { column, row },
            InputKind::Button => InputAction::Release { column, row },
            InputKind::TurnLeft => InputAction::RotateLeft { column, row },
            InputKind::TurnRight => InputAction::RotateRight { column, row },
            InputKind::SwipeLeft => InputAction::SwipeLeft { column, row },
            InputKind::SwipeRight => InputAction::SwipeRight { column, row },
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(id: u8, state: u8) -> Vec<u8> {
        let mut report = ACK_HEADER.to_vec();
        report.push(id);
        report.push(state);
        report.resize(INPUT_REPORT_LEN, 0);
        report
    }

    #[test]
    fn test_command_report_is_fixed_length_with_prefix() {
        // Act
        let report = Command::Brightness(80).to_report();

        // Assert
        assert_eq!(report.len(), REPORT_LEN);
        assert_eq!(report[0], REPORT_ID);
        assert_eq!(&report[1..6], b"CRT\0\0");
        assert_eq!(&report[6..11], b"LIG\0\0");
        assert_eq!(report[11], 80);
        assert!(report[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_brightness_is_capped_at_hundred() {
        assert_eq!(Command::Brightness(250).body()[5], 100);
    }

    #[test]
    fn test_clear_all_targets_0xff() {
        let report = Command::ClearAll.to_report();
        assert_eq!(&report[6..12], b"CLE\0\0\0");
        assert_eq!(report[12], 0xff);
    }

    #[test]
    fn test_image_header_encodes_size_big_endian_then_display_id() {
        let body = Command::ImageHeader {
            display_id: 7,
            size: 0x0102_0304,
        }
        .body();
        assert_eq!(body, [b'B', b'A', b'T', 0x01, 0x02, 0x03, 0x04, 7]);
    }

    #[test]
    fn test_encode_packets_chunks_overflow_without_prefix() {
        // Arrange: prefix 5 + payload 2000 -> 1019 in the first packet, 981 in the second
        let prefix = b"HEAD!";
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        // Act
        let reports = encode_packets(prefix, &payload);

        // Assert
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.len() == REPORT_LEN));
        assert_eq!(&reports[0][1..6], prefix);
        assert_eq!(&reports[0][6..], &payload[..1019]);
        assert_eq!(&reports[1][1..982], &payload[1019..]);
        assert!(reports[1][982..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_packets_exact_fit_produces_single_packet() {
        let payload = vec![0xAB; PACKET_SIZE];
        let reports = encode_packets(&[], &payload);
        assert_eq!(reports.len(), 1);
        assert_eq!(&reports[0][1..], payload.as_slice());
    }

    #[test]
    fn test_image_reports_are_header_data_flush() {
        let jpeg = vec![0x55; 1500];
        let reports = image_reports(3, &jpeg);

        assert_eq!(reports.len(), 4);
        assert_eq!(&reports[0][6..9], b"BAT");
        assert_eq!(&reports[0][9..13], &1500u32.to_be_bytes());
        assert_eq!(reports[0][13], 3);
        assert_eq!(&reports[1][1..], &jpeg[..PACKET_SIZE]);
        assert_eq!(&reports[2][1..477], &jpeg[PACKET_SIZE..]);
        assert_eq!(&reports[3][6..9], b"STP");
    }

    #[test]
    fn test_parse_input_report_extracts_id_and_state() {
        let raw = parse_input_report(&ack(0x05, 1)).unwrap();
        assert_eq!(raw, Some(RawInput { id: 0x05, state: 1 }));
    }

    #[test]
    fn test_parse_input_report_ignores_non_ack() {
        let mut report = ack(0x05, 1);
        report[0] = b'X';
        assert_eq!(parse_input_report(&report).unwrap(), None);
    }

    #[test]
    fn test_parse_input_report_rejects_truncated() {
        assert_eq!(
            parse_input_report(&[b'A', b'C', b'K']),
            Err(PacketError::TooShort {
                needed: 11,
                available: 3
            })
        );
    }

    #[test]
    fn test_n4_decodes_buttons_encoders_and_swipes() {
        let m = StreamDockModel::N4;
        assert_eq!(
            m.decode_input(RawInput { id: 0x07, state: 1 }),
            Some(InputAction::Press { column: 1, row: 1 })
        );
        assert_eq!(
            m.decode_input(RawInput { id: 0x07, state: 0 }),
            Some(InputAction::Release { column: 1, row: 1 })
        );
        assert_eq!(
            m.decode_input(RawInput { id: 0x51, state: 0 }),
            Some(InputAction::RotateRight { column: 1, row: 3 })
        );
        assert_eq!(
            m.decode_input(RawInput { id: 0x38, state: 0 }),
            Some(InputAction::SwipeLeft { column: 4, row: 2 })
        );
        assert_eq!(m.decode_input(RawInput { id: 0xEE, state: 1 }), None);
    }

    #[test]
    fn test_every_input_lands_inside_the_grid() {
        for model in [StreamDockModel::N4, StreamDockModel::Classic15] {
            let grid = model.grid_size();
            for m in model.inputs() {
                assert!(grid.contains(m.column, m.row), "{model:?} 0x{:02x}", m.raw_id);
            }
        }
    }

    #[test]
    fn test_n4_display_slots() {
        let m = StreamDockModel::N4;
        assert_eq!(m.display_slot(0, 0).map(|s| s.display_id), Some(11));
        assert_eq!(m.display_slot(4, 1).map(|s| s.display_id), Some(10));
        assert_eq!(m.display_slot(3, 2), Some(DisplaySlot { display_id: 4, width: 176, height: 112 }));
        assert_eq!(m.display_slot(0, 3), None);
        assert_eq!(m.display_slot(4, 2), None);
        assert_eq!(m.display_slots().len(), 14);
    }

    #[test]
    fn test_classic15_display_slots_are_row_major() {
        let m = StreamDockModel::Classic15;
        assert_eq!(m.display_slot(0, 0).map(|s| s.display_id), Some(1));
        assert_eq!(m.display_slot(4, 2).map(|s| s.display_id), Some(15));
        assert_eq!(m.display_slots().len(), 15);
    }
}
