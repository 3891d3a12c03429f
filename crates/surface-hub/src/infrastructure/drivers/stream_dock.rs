//! Stream Dock driver (N4 and 15-key models).
//!
//! Draws go through a [`CoalescingQueue`] keyed by cell.  Each job scales and
//! rotates the rendered button to the key's native size, squeezes it into
//! the per-key JPEG budget and uploads it as `BAT` + data + `STP`.
//!
//! Encoding problems skip that one frame.  A write that still fails after
//! retries loses the device: the panel emits `Remove` once and never writes
//! again.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use surface_core::domain::config::lcd_panel_fields;
use surface_core::imaging::{encode_jpeg_within_budget, fit};
use surface_core::protocol::stream_dock::{
    image_reports, parse_input_report, Command, InputAction, StreamDockModel, IMAGE_BYTE_BUDGET,
};
use surface_core::{CellKey, DrawItem, FamilyConfig, GridSize, PanelConfig, PanelInfo, RenderedImage, Rotation};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::HidLink;
use crate::application::coalescing_queue::{CoalescingQueue, QueueProcessor};
use crate::application::panel::{escalate_queue_errors, PanelEventSender, PanelEvents, SurfaceError, SurfacePanel};
use crate::infrastructure::hid::HidTransport;

// ── Draw processor ───────────────────────────────────────────────────────────

struct KeyImageWriter {
    model: StreamDockModel,
    link: Arc<HidLink>,
    rotation: Mutex<Rotation>,
}

impl KeyImageWriter {
    fn rotation(&self) -> MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueProcessor<CellKey, RenderedImage> for KeyImageWriter {
    async fn process(&self, key: CellKey, image: RenderedImage) -> Result<(), SurfaceError> {
        if self.link.is_closed() {
            return Ok(());
        }
        let Some(slot) = self.model.display_slot(key.column, key.row) else {
            return Ok(());
        };
        let rotation = self.rotation().compose(self.model.mount_rotation());

        let pixels = image.pixels;
        let encoded = tokio::task::spawn_blocking(move || {
            let img = fit(&pixels, slot.width, slot.height, rotation);
            encode_jpeg_within_budget(&img, IMAGE_BYTE_BUDGET)
        })
        .await;
        let jpeg = match encoded {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                warn!("{}: skipping frame for {key}: {e}", self.link.device_id());
                return Ok(());
            }
            Err(e) => {
                warn!("{}: encoder task failed for {key}: {e}", self.link.device_id());
                return Ok(());
            }
        };
        debug!(
            "{}: {key} -> display {} ({} bytes, quality {})",
            self.link.device_id(),
            slot.display_id,
            jpeg.data.len(),
            jpeg.quality
        );

        self.link.send(&image_reports(slot.display_id, &jpeg.data)).await
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// One attached Stream Dock.
pub struct StreamDockPanel {
    model: StreamDockModel,
    info: PanelInfo,
    link: Arc<HidLink>,
    writer: Arc<KeyImageWriter>,
    draws: CoalescingQueue<CellKey, RenderedImage>,
    config: Mutex<PanelConfig>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamDockPanel {
    /// Opens a deck: construct, handshake, start the input reader.
    ///
    /// # Errors
    ///
    /// Returns [`SurfaceError::Initialize`] if the handshake fails.  The
    /// handle is closed by then.
    pub async fn open(
        hid: Arc<dyn HidTransport>,
        model: StreamDockModel,
    ) -> Result<(Arc<Self>, PanelEvents), SurfaceError> {
        let (panel, events) = Self::new(hid, model);
        panel.initialize().await?;
        panel.start_reader();
        info!("{}: {} ready", panel.info.device_id, model.name());
        Ok((panel, events))
    }

    /// First phase: wraps an open handle.  Nothing is written yet.
    pub fn new(hid: Arc<dyn HidTransport>, model: StreamDockModel) -> (Arc<Self>, PanelEvents) {
        let device_id = hid.serial_number().unwrap_or_else(|| hid.path().to_string());
        let (events, events_rx) = PanelEventSender::channel();
        let link = Arc::new(HidLink::new(device_id.clone(), hid, events.clone()));

        let writer = Arc::new(KeyImageWriter {
            model,
            link: Arc::clone(&link),
            rotation: Mutex::new(Rotation::None),
        });
        let (draws, errors) = CoalescingQueue::new(Arc::clone(&writer));
        escalate_queue_errors(device_id.clone(), errors, events);

        let mut info = PanelInfo::new(model.name(), device_id);
        info.config_fields = lcd_panel_fields();
        info.capabilities.brightness = true;
        info.capabilities.rotation = true;

        let panel = Arc::new(Self {
            model,
            info,
            link,
            writer,
            draws,
            config: Mutex::new(PanelConfig::new(FamilyConfig::StreamDock)),
            reader: Mutex::new(None),
        });
        (panel, events_rx)
    }

    /// Second phase: wake the deck, apply the default brightness and blank
    /// every key.
    ///
    /// # Errors
    ///
    /// Returns [`SurfaceError::Initialize`] and closes the handle on failure.
    pub async fn initialize(&self) -> Result<(), SurfaceError> {
        let brightness = self.lock_config().brightness;
        let handshake = [
            Command::Wake.to_report(),
            Command::Brightness(brightness).to_report(),
            Command::ClearAll.to_report(),
        ];
        self.link.send_during_init(&handshake).await
    }

    fn start_reader(&self) {
        let model = self.model;
        let events = self.link.events().clone();
        let device_id = self.info.device_id.clone();
        let handle = self.link.spawn_reader(move |report| {
            dispatch_input(model, &device_id, &events, report);
        });
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn lock_config(&self) -> MutexGuard<'_, PanelConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn model(&self) -> StreamDockModel {
        self.model
    }

    async fn send_or_log(&self, what: &str, reports: &[Vec<u8>]) {
        if let Err(e) = self.link.send(reports).await {
            warn!("{}: {what} failed: {e}", self.info.device_id);
        }
    }
}

/// Turns one input report into panel events.
fn dispatch_input(model: StreamDockModel, device_id: &str, events: &PanelEventSender, report: &[u8]) {
    let raw = match parse_input_report(report) {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(e) => {
            warn!("{device_id}: bad input report: {e}");
            return;
        }
    };
    match model.decode_input(raw) {
        Some(InputAction::Press { column, row }) => events.click(column, row, true),
        Some(InputAction::Release { column, row }) => events.click(column, row, false),
        Some(InputAction::RotateLeft { column, row }) | Some(InputAction::SwipeLeft { column, row }) => {
            events.rotate(column, row, false)
        }
        Some(InputAction::RotateRight { column, row }) | Some(InputAction::SwipeRight { column, row }) => {
            events.rotate(column, row, true)
        }
        None => debug!("{device_id}: unmapped input id {:#04x}", raw.id),
    }
}

#[async_trait]
impl SurfacePanel for StreamDockPanel {
    fn info(&self) -> PanelInfo {
        self.info.clone()
    }

    fn grid_size(&self) -> GridSize {
        self.model.grid_size()
    }

    fn draw(&self, item: DrawItem) {
        if self.link.is_closed() || !self.grid_size().contains(item.x, item.y) {
            return;
        }
        self.draws.queue(CellKey::new(item.y, item.x), item.image);
    }

    async fn clear_deck(&self) {
        self.send_or_log("clear", &[Command::ClearAll.to_report()]).await;
    }

    async fn set_config(&self, config: PanelConfig, force: bool) {
        let (config, adjustments) = config.validated(&self.info.config_fields);
        for adjustment in &adjustments {
            warn!("{}: config {adjustment}", self.info.device_id);
        }

        let previous = std::mem::replace(&mut *self.lock_config(), config.clone());
        *self.writer.rotation() = config.rotation;

        if force || previous.brightness != config.brightness {
            self.send_or_log("brightness", &[Command::Brightness(config.brightness).to_report()])
                .await;
        }
    }

    async fn quit(&self) {
        self.draws.close();
        if !self.link.is_closed() {
            self.send_or_log("clear", &[Command::ClearAll.to_report(), Command::Sleep.to_report()])
                .await;
            self.link.close().await;
        }
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
