//! SatelliteSession: one remote device, driven over a Satellite connection.
//!
//! A session is a panel like any other: it implements [`SurfacePanel`], owns
//! a [`CoalescingQueue`] for draws and reports input through a
//! [`PanelEventSender`].  The difference is the "device" is a line-protocol
//! client on another machine, so a draw becomes one or more `KEY-STATE`
//! messages instead of HID reports.
//!
//! # Session states (for beginners)
//!
//! ```text
//! Connected ──ADD-DEVICE──► LayoutNegotiated ──attached──► Active
//!                                                              │
//!                                   REMOVE-DEVICE / disconnect / quit
//!                                                              ▼
//!                                                           Closed
//! ```
//!
//! `Connected` belongs to the connection (no device declared yet).  The
//! session itself is born in `LayoutNegotiated`, once the handshake has been
//! resolved into an [`Addressing`] mode.
//!
//! # Addressing
//!
//! - **Legacy**: the client declared `KEYS_TOTAL` and `KEYS_PER_ROW`.  Keys
//!   are addressed by row-major index and share one style.
//! - **Manifest**: the client sent a layout manifest.  Every cell maps to the
//!   controls placed on it, each with its own style preset, and a draw on a
//!   cell is sent once per control.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use surface_core::domain::config::{brightness_field, offset_fields, rotation_field};
use surface_core::imaging;
use surface_core::protocol::{
    AddDeviceRequest, ControlAddress, KeyState, ResolvedLayout, StyleCapabilities, VariableDirection,
};
use surface_core::{
    index_from_xy, xy_from_index, CellKey, ConfigField, DrawItem, FamilyConfig, GridSize, PanelConfig, PanelInfo,
    RenderedImage, Rotation, SatelliteMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::application::coalescing_queue::{CoalescingQueue, QueueProcessor};
use crate::application::panel::{
    escalate_queue_errors, PanelEventSender, PanelEvents, SurfaceError, SurfacePanel,
};
use crate::application::variable_bridge::{ExpressionEvaluator, OutputVariableBridge, DEFAULT_VARIABLE_SETTLE};

/// Lifecycle of a [`SatelliteSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LayoutNegotiated,
    Active,
    Closed,
}

/// How the client addresses its controls.
#[derive(Debug, Clone)]
pub enum Addressing {
    Legacy {
        keys_total: u32,
        grid: GridSize,
        style: StyleCapabilities,
    },
    Manifest(ResolvedLayout),
}

impl Addressing {
    pub fn from_request(request: &AddDeviceRequest) -> Self {
        match &request.layout_manifest {
            Some(manifest) => Addressing::Manifest(manifest.resolve()),
            None => {
                let columns = request.keys_per_row.max(1);
                let rows = request.keys_total.div_ceil(columns);
                let grid = if rows == 0 {
                    GridSize::new(0, 0)
                } else {
                    GridSize::new(columns, rows)
                };
                Addressing::Legacy {
                    keys_total: request.keys_total,
                    grid,
                    style: request.legacy_style(),
                }
            }
        }
    }

    pub fn grid_size(&self) -> GridSize {
        match self {
            Addressing::Legacy { grid, .. } => *grid,
            Addressing::Manifest(layout) => layout.grid_size(),
        }
    }

    /// Maps an inbound control address to `(column, row)`.
    ///
    /// Returns `None` for anything that does not name an existing control.
    pub fn locate(&self, control: &ControlAddress) -> Option<(u32, u32)> {
        match (self, control) {
            (Addressing::Legacy { keys_total, grid, .. }, ControlAddress::Key(index)) => {
                if index >= keys_total {
                    return None;
                }
                xy_from_index(*index as usize, *grid)
            }
            (Addressing::Legacy { grid, .. }, ControlAddress::Cell(cell)) => {
                grid.contains(cell.column, cell.row).then_some((cell.column, cell.row))
            }
            (Addressing::Legacy { .. }, ControlAddress::ControlId(_)) => None,
            (Addressing::Manifest(layout), ControlAddress::ControlId(id)) => {
                layout.cell_of(id).map(|cell| (cell.column, cell.row))
            }
            (Addressing::Manifest(layout), ControlAddress::Cell(cell)) => {
                (!layout.controls_at(*cell).is_empty()).then_some((cell.column, cell.row))
            }
            (Addressing::Manifest(layout), ControlAddress::Key(index)) => {
                let (column, row) = xy_from_index(*index as usize, layout.grid_size())?;
                (!layout.controls_at(CellKey::new(row, column)).is_empty()).then_some((column, row))
            }
        }
    }
}

/// One `KEY-STATE` for a control with the given style.
///
/// Parameters the style does not support are left out.
fn key_state(
    device_id: &str,
    control: ControlAddress,
    style: &StyleCapabilities,
    image: &RenderedImage,
    rotation: Rotation,
) -> KeyState {
    let look = &image.style;
    KeyState {
        device_id: device_id.to_string(),
        control: Some(control),
        kind: look.kind,
        pressed: look.pressed,
        bitmap: style
            .bitmap
            .filter(|size| size.is_drawable())
            .map(|size| imaging::raw_rgb(&image.pixels, size.w, size.h, rotation)),
        color: style.colors.map(|mode| look.background_color.format(mode)),
        text_color: style.colors.map(|mode| look.text_color.format(mode)),
        text: style.text.then(|| look.text.clone().unwrap_or_default()),
        font_size: style
            .text_style
            .then(|| look.font_size.map_or_else(|| "auto".to_string(), |size| size.to_string())),
    }
}

/// Every `KEY-STATE` needed to show `image` at `(x, y)`, bitmaps turned by
/// `rotation`.
///
/// Legacy keys at or beyond `KEYS_TOTAL` produce nothing, as do manifest
/// cells without controls.
pub fn build_key_states(
    device_id: &str,
    addressing: &Addressing,
    x: u32,
    y: u32,
    image: &RenderedImage,
    rotation: Rotation,
) -> Vec<KeyState> {
    match addressing {
        Addressing::Legacy {
            keys_total,
            grid,
            style,
        } => match index_from_xy(x, y, *grid) {
            Some(index) if (index as u64) < u64::from(*keys_total) => {
                vec![key_state(device_id, ControlAddress::Key(index as u32), style, image, rotation)]
            }
            _ => Vec::new(),
        },
        Addressing::Manifest(layout) => layout
            .controls_at(CellKey::new(y, x))
            .iter()
            .map(|control| {
                key_state(device_id, ControlAddress::ControlId(control.id.clone()), &control.style, image, rotation)
            })
            .collect(),
    }
}

/// Config schema for a Satellite device: offsets, brightness when the client
/// supports it, rotation when it shows bitmaps, and one field per declared
/// variable.
pub fn config_fields(request: &AddDeviceRequest) -> Vec<ConfigField> {
    let mut fields = offset_fields();
    if request.brightness {
        fields.push(brightness_field());
    }
    let shows_bitmaps = match &request.layout_manifest {
        Some(manifest) => manifest
            .style_presets
            .values()
            .any(|preset| preset.bitmap.is_some_and(|size| size.is_drawable())),
        None => request.bitmap_size.is_some(),
    };
    if shows_bitmaps {
        fields.push(rotation_field());
    }
    for variable in &request.variables {
        fields.push(match variable.direction {
            VariableDirection::Input => ConfigField::CustomVariable {
                id: variable.id.clone(),
                label: variable.name.clone(),
            },
            VariableDirection::Output => ConfigField::Text {
                id: variable.id.clone(),
                label: variable.name.clone(),
                default: String::new(),
                is_expression: true,
            },
        });
    }
    fields
}

/// Turns queued draws into `KEY-STATE` messages.
struct KeyStateWriter {
    device_id: String,
    addressing: Arc<Addressing>,
    rotation: Arc<Mutex<Rotation>>,
    outbound: mpsc::UnboundedSender<SatelliteMessage>,
}

#[async_trait]
impl QueueProcessor<CellKey, RenderedImage> for KeyStateWriter {
    async fn process(&self, cell: CellKey, image: RenderedImage) -> Result<(), SurfaceError> {
        let device_id = self.device_id.clone();
        let addressing = Arc::clone(&self.addressing);
        let rotation = *self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        // Resizing bitmaps is CPU work; keep it off the runtime threads.
        let built = tokio::task::spawn_blocking(move || {
            build_key_states(&device_id, &addressing, cell.column, cell.row, &image, rotation)
        })
        .await;
        let states = match built {
            Ok(states) => states,
            Err(e) => {
                warn!("{}: building key state for {cell:?} failed: {e}", self.device_id);
                return Ok(());
            }
        };
        for state in states {
            self.outbound
                .send(SatelliteMessage::KeyState(Box::new(state)))
                .map_err(|_| SurfaceError::Closed)?;
        }
        Ok(())
    }
}

/// A remote Satellite device acting as a panel.
pub struct SatelliteSession {
    info: PanelInfo,
    addressing: Arc<Addressing>,
    supports_brightness: bool,
    supports_pincode_lock: bool,
    inputs: HashSet<String>,
    outputs: HashSet<String>,
    outbound: mpsc::UnboundedSender<SatelliteMessage>,
    events: PanelEventSender,
    draws: CoalescingQueue<CellKey, RenderedImage>,
    variables: OutputVariableBridge,
    rotation: Arc<Mutex<Rotation>>,
    config: Mutex<Option<PanelConfig>>,
    state: Mutex<SessionState>,
}

impl SatelliteSession {
    /// Builds a session from a parsed `ADD-DEVICE`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        request: &AddDeviceRequest,
        outbound: mpsc::UnboundedSender<SatelliteMessage>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> (Arc<Self>, PanelEvents) {
        let device_id = request.device_id.clone();
        let addressing = Arc::new(Addressing::from_request(request));

        let mut info = PanelInfo::new(request.product_name.clone(), device_id.clone());
        info.description = format!("Satellite: {}", request.product_name);
        info.config_fields = config_fields(request);
        info.capabilities.brightness = request.brightness;
        info.capabilities.pincode_lock = request.pincode_lock;
        info.capabilities.variables = !request.variables.is_empty();

        let declared = |direction: VariableDirection| -> HashSet<String> {
            request
                .variables
                .iter()
                .filter(|v| v.direction == direction)
                .map(|v| v.id.clone())
                .collect()
        };

        let (events, events_rx) = PanelEventSender::channel();
        let rotation = Arc::new(Mutex::new(Rotation::None));
        let writer = Arc::new(KeyStateWriter {
            device_id: device_id.clone(),
            addressing: Arc::clone(&addressing),
            rotation: Arc::clone(&rotation),
            outbound: outbound.clone(),
        });
        let (draws, draw_errors) = CoalescingQueue::new(writer);
        escalate_queue_errors(device_id.clone(), draw_errors, events.clone());

        let variables = OutputVariableBridge::new(device_id.clone(), evaluator, outbound.clone(), DEFAULT_VARIABLE_SETTLE);

        debug!(
            "{device_id}: negotiated {} addressing, grid {}",
            match addressing.as_ref() {
                Addressing::Legacy { .. } => "legacy",
                Addressing::Manifest(_) => "manifest",
            },
            addressing.grid_size()
        );

        let session = Arc::new(Self {
            info,
            addressing,
            supports_brightness: request.brightness,
            supports_pincode_lock: request.pincode_lock,
            inputs: declared(VariableDirection::Input),
            outputs: declared(VariableDirection::Output),
            outbound,
            events,
            draws,
            variables,
            rotation,
            config: Mutex::new(None),
            state: Mutex::new(SessionState::LayoutNegotiated),
        });
        (session, events_rx)
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config(&self) -> MutexGuard<'_, Option<PanelConfig>> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks the session attached to the surface manager.
    pub fn activate(&self) {
        let mut state = self.lock_state();
        if *state == SessionState::LayoutNegotiated {
            *state = SessionState::Active;
        }
    }

    fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn send(&self, message: SatelliteMessage) {
        if self.outbound.send(message).is_err() {
            debug!("{}: connection gone, dropping message", self.device_id());
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub fn handle_key_press(&self, control: &ControlAddress, pressed: bool) {
        match self.addressing.locate(control) {
            Some((column, row)) => self.events.click(column, row, pressed),
            None => warn!("{}: KEY-PRESS for unknown control {control:?}", self.device_id()),
        }
    }

    pub fn handle_key_rotate(&self, control: &ControlAddress, clockwise: bool) {
        match self.addressing.locate(control) {
            Some((column, row)) => self.events.rotate(column, row, clockwise),
            None => warn!("{}: KEY-ROTATE for unknown control {control:?}", self.device_id()),
        }
    }

    pub fn handle_pincode_key(&self, digit: u8) {
        self.events.pincode_key(digit);
    }

    /// A value pushed by the client for one of its input variables.
    ///
    /// Forwarded only when the variable was declared as an input and the
    /// user bound it to a custom variable.
    pub fn handle_set_variable(&self, variable: &str, value: &str) {
        if !self.inputs.contains(variable) {
            warn!("{}: SET-VARIABLE-VALUE for undeclared input {variable}", self.device_id());
            return;
        }
        let target = match self.lock_config().as_ref().map(|c| &c.family) {
            Some(FamilyConfig::Satellite { bindings }) => bindings.get(variable).cloned(),
            _ => None,
        };
        match target.filter(|name| !name.is_empty()) {
            Some(name) => self.events.set_custom_variable(name, value),
            None => debug!("{}: input {variable} is not bound", self.device_id()),
        }
    }

    /// The client or connection went away.
    pub fn remove(&self) {
        if self.events.remove() {
            info!("{}: removed", self.device_id());
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.draws.close();
        self.variables.close();
    }
}

#[async_trait]
impl SurfacePanel for SatelliteSession {
    fn info(&self) -> PanelInfo {
        self.info.clone()
    }

    fn grid_size(&self) -> GridSize {
        self.addressing.grid_size()
    }

    fn draw(&self, item: DrawItem) {
        if self.is_closed() {
            return;
        }
        if !self.grid_size().contains(item.x, item.y) {
            trace!("{}: ignoring draw outside grid at {},{}", self.device_id(), item.x, item.y);
            return;
        }
        self.draws.queue(CellKey::new(item.y, item.x), item.image);
    }

    async fn clear_deck(&self) {
        if self.is_closed() {
            return;
        }
        self.send(SatelliteMessage::KeysClear {
            device_id: self.device_id().to_string(),
        });
    }

    async fn set_config(&self, config: PanelConfig, force: bool) {
        if self.is_closed() {
            return;
        }
        let (config, adjustments) = config.validated(&self.info.config_fields);
        for adjustment in &adjustments {
            warn!("{}: config {adjustment}", self.device_id());
        }

        let previous = self.lock_config().replace(config.clone());
        *self.rotation.lock().unwrap_or_else(|e| e.into_inner()) = config.rotation;

        let brightness_changed = previous.as_ref().map(|p| p.brightness) != Some(config.brightness);
        if self.supports_brightness && (force || brightness_changed) {
            self.send(SatelliteMessage::Brightness {
                device_id: self.device_id().to_string(),
                value: config.brightness,
            });
        }

        let outputs: HashMap<String, String> = match &config.family {
            FamilyConfig::Satellite { bindings } => bindings
                .iter()
                .filter(|(id, _)| self.outputs.contains(*id))
                .map(|(id, expression)| (id.clone(), expression.clone()))
                .collect(),
            _ => HashMap::new(),
        };
        self.variables.set_bindings(outputs, force);
    }

    fn set_locked(&self, locked: bool, character_count: usize) {
        if !self.supports_pincode_lock || self.is_closed() {
            return;
        }
        self.send(SatelliteMessage::LockedState {
            device_id: self.device_id().to_string(),
            locked,
            character_count,
        });
    }

    fn on_variables_changed(&self, changed: &HashSet<String>) {
        if !self.is_closed() {
            self.variables.on_variables_changed(changed);
        }
    }

    async fn quit(&self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::panel::PanelEvent;
    use crate::application::variable_bridge::{Evaluation, MockExpressionEvaluator};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use surface_core::protocol::{parse_command, SatelliteCommand};
    use surface_core::{ButtonStyle, ColorMode, PixelBuffer, PixelFormat, Rgb};
    use tokio::time::timeout;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn request(line: &str) -> AddDeviceRequest {
        match parse_command(line).unwrap() {
            SatelliteCommand::AddDevice(req) => *req,
            other => panic!("not an ADD-DEVICE: {other:?}"),
        }
    }

    fn manifest_request(json: &str) -> AddDeviceRequest {
        request(&format!(
            "ADD-DEVICE DEVICEID=m1 PRODUCT_NAME=Panel LAYOUT_MANIFEST={}",
            BASE64.encode(json)
        ))
    }

    fn image(text: &str) -> RenderedImage {
        RenderedImage::new(
            PixelBuffer::solid(8, 8, Rgb::new(255, 0, 0)),
            ButtonStyle {
                background_color: Rgb::new(255, 0, 0),
                text: Some(text.to_string()),
                text_color: Rgb::WHITE,
                ..ButtonStyle::default()
            },
        )
    }

    fn no_evaluator() -> Arc<dyn ExpressionEvaluator> {
        Arc::new(MockExpressionEvaluator::new())
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SatelliteMessage>) -> SatelliteMessage {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    // ── Addressing ───────────────────────────────────────────────────────────

    #[test]
    fn test_legacy_grid_rounds_rows_up() {
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=10 KEYS_PER_ROW=4");
        assert_eq!(Addressing::from_request(&req).grid_size(), GridSize::new(4, 3));
    }

    #[test]
    fn test_legacy_skips_keys_beyond_total() {
        // Arrange: 10 keys on a 4x3 grid, so (2,2) and (3,2) do not exist
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=10 KEYS_PER_ROW=4");
        let addressing = Addressing::from_request(&req);

        // Act
        let inside = build_key_states("a", &addressing, 1, 2, &image("x"), Rotation::None);
        let beyond = build_key_states("a", &addressing, 2, 2, &image("x"), Rotation::None);

        // Assert
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].control, Some(ControlAddress::Key(9)));
        assert!(beyond.is_empty());
    }

    #[test]
    fn test_style_without_colors_or_bitmap_omits_those_fields() {
        // Arrange
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4 BITMAPS=false TEXT=true");
        let addressing = Addressing::from_request(&req);

        // Act
        let states = build_key_states("a", &addressing, 0, 0, &image("hi"), Rotation::None);
        let line = SatelliteMessage::KeyState(Box::new(states[0].clone())).to_line();

        // Assert
        assert!(states[0].bitmap.is_none());
        assert!(states[0].color.is_none());
        assert!(!line.contains("COLOR"));
        assert!(!line.contains("TEXTCOLOR"));
        assert!(!line.contains("BITMAP"));
        assert!(line.contains("TEXT="));
    }

    #[test]
    fn test_full_style_carries_bitmap_colors_and_font_size() {
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4 BITMAPS=24 COLORS=rgb TEXT TEXT_STYLE");
        let addressing = Addressing::from_request(&req);

        let states = build_key_states("a", &addressing, 3, 0, &image("hi"), Rotation::None);

        let state = &states[0];
        assert_eq!(state.bitmap.as_ref().map(Vec::len), Some(24 * 24 * 3));
        assert_eq!(state.color.as_deref(), Some("rgb(255,0,0)"));
        assert_eq!(state.text_color.as_deref(), Some("rgb(255,255,255)"));
        assert_eq!(state.text.as_deref(), Some("hi"));
        assert_eq!(state.font_size.as_deref(), Some("auto"));
        assert_eq!(req.color_mode, Some(ColorMode::Rgb));
    }

    #[test]
    fn test_manifest_cell_with_two_controls_yields_two_states() {
        // Arrange
        let req = manifest_request(
            r#"{
                "stylePresets": {
                    "default": {"bitmap": {"w": 16, "h": 16}},
                    "lcd": {"colors": "hex", "text": true}
                },
                "controls": {
                    "k1": {"row": 0, "column": 1},
                    "k1-led": {"row": 0, "column": 1, "stylePreset": "lcd"}
                }
            }"#,
        );
        let addressing = Addressing::from_request(&req);

        // Act
        let states = build_key_states("m1", &addressing, 1, 0, &image("t"), Rotation::None);

        // Assert
        let ids: Vec<_> = states.iter().map(|s| s.control.clone()).collect();
        assert_eq!(
            ids,
            vec![
                Some(ControlAddress::ControlId("k1".to_string())),
                Some(ControlAddress::ControlId("k1-led".to_string())),
            ]
        );
        assert!(states[0].bitmap.is_some() && states[0].color.is_none());
        assert!(states[1].bitmap.is_none() && states[1].color.as_deref() == Some("#ff0000"));
    }

    #[test]
    fn test_locate_fails_closed_on_unknown_controls() {
        let legacy = Addressing::from_request(&request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=5 KEYS_PER_ROW=5"));
        assert_eq!(legacy.locate(&ControlAddress::Key(4)), Some((4, 0)));
        assert_eq!(legacy.locate(&ControlAddress::Key(5)), None);
        assert_eq!(legacy.locate(&ControlAddress::Cell(CellKey::new(0, 2))), Some((2, 0)));
        assert_eq!(legacy.locate(&ControlAddress::Cell(CellKey::new(1, 0))), None);
        assert_eq!(legacy.locate(&ControlAddress::ControlId("x".into())), None);

        let manifest = Addressing::from_request(&manifest_request(
            r#"{"stylePresets": {}, "controls": {"enc": {"row": 1, "column": 2}}}"#,
        ));
        assert_eq!(manifest.locate(&ControlAddress::ControlId("enc".into())), Some((2, 1)));
        assert_eq!(manifest.locate(&ControlAddress::ControlId("nope".into())), None);
        assert_eq!(manifest.locate(&ControlAddress::Cell(CellKey::new(0, 0))), None);
    }

    #[test]
    fn test_config_fields_follow_declared_variables() {
        let vars = r#"[{"id":"in1","type":"input","name":"Fader"},{"id":"out1","type":"output","name":"Label"}]"#;
        let req = request(&format!(
            "ADD-DEVICE DEVICEID=a BRIGHTNESS=false VARIABLES={}",
            BASE64.encode(vars)
        ));

        let fields = config_fields(&req);

        let ids: Vec<&str> = fields.iter().map(ConfigField::id).collect();
        assert!(!ids.contains(&"brightness"));
        assert!(matches!(fields.iter().find(|f| f.id() == "in1"), Some(ConfigField::CustomVariable { .. })));
        assert!(matches!(
            fields.iter().find(|f| f.id() == "out1"),
            Some(ConfigField::Text { is_expression: true, .. })
        ));
    }

    #[test]
    fn test_rotation_offered_only_for_bitmap_devices() {
        let with_bitmaps = config_fields(&request("ADD-DEVICE DEVICEID=a BITMAPS=72"));
        let without = config_fields(&request("ADD-DEVICE DEVICEID=a BITMAPS=false"));

        assert!(with_bitmaps.iter().any(|f| f.id() == "rotation"));
        assert!(!without.iter().any(|f| f.id() == "rotation"));
    }

    // ── Session ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_configured_rotation_turns_bitmaps() {
        // Arrange: left pixel red, right pixel blue
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4 BITMAPS=2");
        let (session, _events) = SatelliteSession::new(&req, tx, no_evaluator());
        session.activate();
        let pixels = PixelBuffer::new(2, 1, PixelFormat::Rgb, vec![255, 0, 0, 0, 0, 255]).unwrap();
        let mut config = PanelConfig::new(FamilyConfig::Satellite {
            bindings: BTreeMap::new(),
        });
        config.rotation = Rotation::Rotate180;
        session.set_config(config, false).await;
        while rx.try_recv().is_ok() {}

        // Act
        session.draw(DrawItem::new(0, 0, RenderedImage::new(pixels.clone(), ButtonStyle::default())));

        // Assert
        match next(&mut rx).await {
            SatelliteMessage::KeyState(state) => {
                assert_eq!(state.bitmap, Some(imaging::raw_rgb(&pixels, 2, 2, Rotation::Rotate180)));
                assert_ne!(state.bitmap, Some(imaging::raw_rgb(&pixels, 2, 2, Rotation::None)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_draw_sends_key_state() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=8 KEYS_PER_ROW=4 BITMAPS=false COLORS=hex");
        let (session, _events) = SatelliteSession::new(&req, tx, no_evaluator());
        session.activate();

        // Act
        session.draw(DrawItem::new(1, 1, image("x")));

        // Assert
        match next(&mut rx).await {
            SatelliteMessage::KeyState(state) => {
                assert_eq!(state.control, Some(ControlAddress::Key(5)));
                assert_eq!(state.color.as_deref(), Some("#ff0000"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_by_zero_device_accepts_draw_and_clear() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=dock KEYS_TOTAL=0 KEYS_PER_ROW=1");
        let (session, _events) = SatelliteSession::new(&req, tx, no_evaluator());
        assert_eq!(session.grid_size(), GridSize::new(0, 0));

        session.draw(DrawItem::new(0, 0, image("x")));
        session.clear_deck().await;

        assert!(matches!(next(&mut rx).await, SatelliteMessage::KeysClear { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_brightness_sent_on_change_or_force_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a");
        let (session, _events) = SatelliteSession::new(&req, tx, no_evaluator());
        let mut config = PanelConfig::new(FamilyConfig::Satellite {
            bindings: BTreeMap::new(),
        });
        config.brightness = 70;

        session.set_config(config.clone(), false).await;
        session.set_config(config.clone(), false).await;
        session.set_config(config, true).await;

        assert!(matches!(next(&mut rx).await, SatelliteMessage::Brightness { value: 70, .. }));
        assert!(matches!(next(&mut rx).await, SatelliteMessage::Brightness { value: 70, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_locked_state_requires_declared_pincode_lock() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let plain = request("ADD-DEVICE DEVICEID=a");
        let (session, _events) = SatelliteSession::new(&plain, tx.clone(), no_evaluator());
        session.set_locked(true, 4);
        assert!(rx.try_recv().is_err());

        let locking = request("ADD-DEVICE DEVICEID=b PINCODE_LOCK=true");
        let (session, _events) = SatelliteSession::new(&locking, tx, no_evaluator());
        session.set_locked(true, 4);
        assert_eq!(
            rx.try_recv().unwrap(),
            SatelliteMessage::LockedState {
                device_id: "b".to_string(),
                locked: true,
                character_count: 4
            }
        );
    }

    #[tokio::test]
    async fn test_key_press_becomes_click_and_unknown_key_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=8 KEYS_PER_ROW=4");
        let (session, mut events) = SatelliteSession::new(&req, tx, no_evaluator());

        session.handle_key_press(&ControlAddress::Key(6), true);
        session.handle_key_press(&ControlAddress::Key(60), true);
        session.handle_key_rotate(&ControlAddress::Cell(CellKey::new(0, 1)), false);

        assert_eq!(
            events.try_recv().unwrap(),
            PanelEvent::Click {
                column: 2,
                row: 1,
                pressed: true
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PanelEvent::Rotate {
                column: 1,
                row: 0,
                clockwise: false
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bound_input_variable_sets_custom_variable() {
        // Arrange
        let vars = r#"[{"id":"in1","type":"input","name":"Fader"}]"#;
        let req = request(&format!("ADD-DEVICE DEVICEID=a VARIABLES={}", BASE64.encode(vars)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, mut events) = SatelliteSession::new(&req, tx, no_evaluator());

        // Unbound: nothing happens
        session.handle_set_variable("in1", "5");
        assert!(events.try_recv().is_err());

        // Act
        let bindings = BTreeMap::from([("in1".to_string(), "fader_level".to_string())]);
        session
            .set_config(PanelConfig::new(FamilyConfig::Satellite { bindings }), false)
            .await;
        session.handle_set_variable("in1", "7");
        session.handle_set_variable("undeclared", "1");

        // Assert
        assert_eq!(
            events.try_recv().unwrap(),
            PanelEvent::SetCustomVariable {
                name: "fader_level".to_string(),
                value: "7".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_output_binding_sends_variable_value() {
        // Arrange
        let vars = r#"[{"id":"out1","type":"output","name":"Label"}]"#;
        let req = request(&format!(
            "ADD-DEVICE DEVICEID=a BRIGHTNESS=false VARIABLES={}",
            BASE64.encode(vars)
        ));
        let mut evaluator = MockExpressionEvaluator::new();
        evaluator.expect_evaluate().returning(|_| {
            Ok(Evaluation {
                value: serde_json::json!("on air"),
                referenced_variables: HashSet::new(),
            })
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, _events) = SatelliteSession::new(&req, tx, Arc::new(evaluator));

        // Act
        let bindings = BTreeMap::from([("out1".to_string(), "$(internal:status)".to_string())]);
        session
            .set_config(PanelConfig::new(FamilyConfig::Satellite { bindings }), false)
            .await;

        // Assert
        assert_eq!(
            next(&mut rx).await,
            SatelliteMessage::VariableValue {
                device_id: "a".to_string(),
                variable: "out1".to_string(),
                value: "on air".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_quit_is_idempotent_and_stops_draws() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4");
        let (session, _events) = SatelliteSession::new(&req, tx, no_evaluator());
        session.activate();

        session.quit().await;
        session.quit().await;
        session.draw(DrawItem::new(0, 0, image("x")));
        session.clear_deck().await;

        assert_eq!(session.state(), SessionState::Closed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_removes_session_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let req = request("ADD-DEVICE DEVICEID=a KEYS_TOTAL=4 KEYS_PER_ROW=4");
        let (session, mut events) = SatelliteSession::new(&req, tx, no_evaluator());
        drop(rx);

        session.draw(DrawItem::new(0, 0, image("x")));
        session.draw(DrawItem::new(1, 0, image("y")));

        let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(first, Some(PanelEvent::Remove));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }
}
