//! RGB backlit keypad driver.
//!
//! These keypads have no screens: a draw only sets a key's backlight to the
//! button's background colour.  Desired and last-sent colours live in two
//! flat arrays indexed by the vendor control id.  Every draw marks the
//! desired colour and pokes a single flush job, which sends whatever
//! differs, up to eight keys per report.  A burst of draws therefore costs a
//! handful of reports instead of one per key.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use surface_core::domain::config::{brightness_field, offset_fields};
use surface_core::protocol::led_keypad::{
    all_off_reports, backlight_reports, intensity_report, parse_key_states, KeypadModel,
};
use surface_core::{DrawItem, FamilyConfig, GridSize, PanelConfig, PanelInfo, Rgb};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::HidLink;
use crate::application::coalescing_queue::{CoalescingQueue, QueueProcessor};
use crate::application::panel::{escalate_queue_errors, PanelEventSender, PanelEvents, SurfaceError, SurfacePanel};
use crate::infrastructure::hid::HidTransport;

/// Desired and sent backlight per control id.
#[derive(Debug)]
struct Backlights {
    desired: Vec<Rgb>,
    /// `None` until the key has been written once.
    sent: Vec<Option<Rgb>>,
}

impl Backlights {
    fn new(keys: usize) -> Self {
        Self {
            desired: vec![Rgb::BLACK; keys],
            sent: vec![None; keys],
        }
    }

    /// Keys whose desired colour has not been sent yet.
    fn dirty(&self) -> Vec<(u8, Rgb)> {
        self.desired
            .iter()
            .zip(&self.sent)
            .enumerate()
            .filter(|(_, (want, have))| **have != Some(**want))
            .map(|(id, (want, _))| (id as u8, *want))
            .collect()
    }
}

struct BacklightFlusher {
    link: Arc<HidLink>,
    backlights: Arc<Mutex<Backlights>>,
}

#[async_trait]
impl QueueProcessor<(), ()> for BacklightFlusher {
    async fn process(&self, _key: (), _payload: ()) -> Result<(), SurfaceError> {
        if self.link.is_closed() {
            return Ok(());
        }
        let updates = lock(&self.backlights).dirty();
        if updates.is_empty() {
            return Ok(());
        }
        self.link.send(&backlight_reports(&updates)).await?;

        let mut lights = lock(&self.backlights);
        for (id, color) in updates {
            lights.sent[usize::from(id)] = Some(color);
        }
        Ok(())
    }
}

fn lock(backlights: &Mutex<Backlights>) -> MutexGuard<'_, Backlights> {
    backlights.lock().unwrap_or_else(|e| e.into_inner())
}

/// One attached keypad.
pub struct LedKeypadPanel {
    model: KeypadModel,
    info: PanelInfo,
    link: Arc<HidLink>,
    backlights: Arc<Mutex<Backlights>>,
    flush: CoalescingQueue<(), ()>,
    config: Mutex<PanelConfig>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LedKeypadPanel {
    /// Opens a keypad: construct, handshake, start the input reader.
    ///
    /// # Errors
    ///
    /// Returns [`SurfaceError::Initialize`] if the handshake fails.
    pub async fn open(hid: Arc<dyn HidTransport>, model: KeypadModel) -> Result<(Arc<Self>, PanelEvents), SurfaceError> {
        let (panel, events) = Self::new(hid, model);
        panel.initialize().await?;
        panel.start_reader();
        info!("{}: {} ready", panel.info.device_id, model.name());
        Ok((panel, events))
    }

    pub fn new(hid: Arc<dyn HidTransport>, model: KeypadModel) -> (Arc<Self>, PanelEvents) {
        let device_id = hid.serial_number().unwrap_or_else(|| hid.path().to_string());
        let (events, events_rx) = PanelEventSender::channel();
        let link = Arc::new(HidLink::new(device_id.clone(), hid, events.clone()));
        let backlights = Arc::new(Mutex::new(Backlights::new(model.key_count())));

        let flusher = Arc::new(BacklightFlusher {
            link: Arc::clone(&link),
            backlights: Arc::clone(&backlights),
        });
        let (flush, errors) = CoalescingQueue::new(flusher);
        escalate_queue_errors(device_id.clone(), errors, events);

        let mut info = PanelInfo::new(model.name(), device_id);
        info.config_fields = offset_fields();
        info.config_fields.push(brightness_field());
        info.capabilities.brightness = true;

        let panel = Arc::new(Self {
            model,
            info,
            link,
            backlights,
            flush,
            config: Mutex::new(PanelConfig::new(FamilyConfig::LedKeypad)),
            reader: Mutex::new(None),
        });
        (panel, events_rx)
    }

    /// Sets the default intensity and turns every backlight off.
    pub async fn initialize(&self) -> Result<(), SurfaceError> {
        let brightness = self.lock_config().brightness;
        let mut handshake = vec![intensity_report(brightness)];
        handshake.extend(all_off_reports());
        self.link.send_during_init(&handshake).await?;

        let mut lights = lock(&self.backlights);
        lights.sent.iter_mut().for_each(|s| *s = Some(Rgb::BLACK));
        Ok(())
    }

    fn start_reader(&self) {
        let model = self.model;
        let events = self.link.events().clone();
        let device_id = self.info.device_id.clone();
        let mut previous = vec![false; model.key_count()];
        let handle = self.link.spawn_reader(move |report| match parse_key_states(model, report) {
            Ok(states) => {
                diff_key_states(model, &previous, &states, &events);
                previous = states;
            }
            Err(e) => warn!("{device_id}: bad input report: {e}"),
        });
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn lock_config(&self) -> MutexGuard<'_, PanelConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a colour without flushing.  Returns `false` for cells without
    /// a key.
    fn stage(&self, item: &DrawItem) -> bool {
        match self.model.control_id(item.x, item.y) {
            Some(id) => {
                lock(&self.backlights).desired[usize::from(id)] = item.image.style.background_color;
                true
            }
            None => false,
        }
    }
}

/// Emits a click for every key whose pressed bit changed.
fn diff_key_states(model: KeypadModel, previous: &[bool], current: &[bool], events: &PanelEventSender) {
    for (id, (was, is)) in previous.iter().zip(current).enumerate() {
        if was == is {
            continue;
        }
        match model.cell_of(id as u8) {
            Some((column, row)) => events.click(column, row, *is),
            None => debug!("control id {id} outside grid"),
        }
    }
}

#[async_trait]
impl SurfacePanel for LedKeypadPanel {
    fn info(&self) -> PanelInfo {
        self.info.clone()
    }

    fn grid_size(&self) -> GridSize {
        self.model.grid_size()
    }

    fn draw(&self, item: DrawItem) {
        if !self.link.is_closed() && self.stage(&item) {
            self.flush.queue((), ());
        }
    }

    fn draw_many(&self, items: Vec<DrawItem>) {
        if self.link.is_closed() {
            return;
        }
        let staged = items.iter().filter(|item| self.stage(item)).count();
        if staged > 0 {
            self.flush.queue((), ());
        }
    }

    async fn clear_deck(&self) {
        if self.link.is_closed() {
            return;
        }
        lock(&self.backlights).desired.iter_mut().for_each(|c| *c = Rgb::BLACK);
        self.flush.queue((), ());
    }

    async fn set_config(&self, config: PanelConfig, force: bool) {
        let (config, adjustments) = config.validated(&self.info.config_fields);
        for adjustment in &adjustments {
            warn!("{}: config {adjustment}", self.info.device_id);
        }
        let previous = std::mem::replace(&mut *self.lock_config(), config.clone());
        if force || previous.brightness != config.brightness {
            if let Err(e) = self.link.send(&[intensity_report(config.brightness)]).await {
                warn!("{}: brightness failed: {e}", self.info.device_id);
            }
        }
    }

    async fn quit(&self) {
        self.flush.close();
        if !self.link.is_closed() {
            if let Err(e) = self.link.send(&all_off_reports()).await {
                debug!("{}: backlight off on quit failed: {e}", self.info.device_id);
            }
            self.link.close().await;
        }
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
