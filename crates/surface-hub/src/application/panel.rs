//! The Panel Contract: the interface every driver implements.
//!
//! A panel is anything the hub can draw on and receive input from: a USB
//! deck, an LED keypad, the in-process emulator, or a remote Satellite
//! device.  The rest of the hub only ever talks to panels through
//! [`SurfacePanel`] and the typed [`PanelEvent`] channel, so it never needs
//! to know which family it is dealing with.
//!
//! # Events instead of callbacks (for beginners)
//!
//! Drivers *push* input to the hub.  Each driver owns the sending half of an
//! unbounded channel ([`PanelEventSender`]); whoever created the driver holds
//! the receiving half and reacts to clicks, rotations and, most importantly,
//! [`PanelEvent::Remove`].  Once a driver sends `Remove` it is dead: the
//! sender suppresses every later event, so consumers can rely on `Remove`
//! being the last thing they see and seeing it exactly once.
//!
//! # Error discipline
//!
//! Methods on [`SurfacePanel`] never return errors.  Recoverable problems
//! (one frame failed to encode, a malformed inbound command) are logged and
//! skipped inside the driver.  Losing the device is reported as `Remove`.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use surface_core::{DrawItem, GridSize, PanelConfig, PanelInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::application::coalescing_queue::QueueError;

/// Errors raised inside drivers.
///
/// These never cross the Panel Contract as return values.  A queue processor
/// that returns one is telling the driver the device is gone.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// A write or read failed after all retries.
    #[error("device I/O failed: {0}")]
    Device(String),

    /// The device or connection has already been closed.
    #[error("device closed")]
    Closed,

    /// The handshake after opening the device failed.
    #[error("initialization failed: {0}")]
    Initialize(String),
}

/// Input and lifecycle events pushed from a driver to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    Click { column: u32, row: u32, pressed: bool },
    Rotate { column: u32, row: u32, clockwise: bool },
    SetCustomVariable { name: String, value: String },
    PincodeKey { digit: u8 },
    /// The grid size changed; redraw everything.
    Resized,
    /// The device is gone.  Always the last event.
    Remove,
}

/// Receiving half of a driver's event channel.
pub type PanelEvents = mpsc::UnboundedReceiver<PanelEvent>;

/// Sending half of a driver's event channel.
///
/// Cloning is cheap; all clones share the "removed" flag.
#[derive(Debug, Clone)]
pub struct PanelEventSender {
    tx: mpsc::UnboundedSender<PanelEvent>,
    removed: Arc<AtomicBool>,
}

impl PanelEventSender {
    /// Creates a connected sender/receiver pair.
    pub fn channel() -> (Self, PanelEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                removed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn click(&self, column: u32, row: u32, pressed: bool) {
        self.send(PanelEvent::Click { column, row, pressed });
    }

    pub fn rotate(&self, column: u32, row: u32, clockwise: bool) {
        self.send(PanelEvent::Rotate { column, row, clockwise });
    }

    pub fn set_custom_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        self.send(PanelEvent::SetCustomVariable {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn pincode_key(&self, digit: u8) {
        self.send(PanelEvent::PincodeKey { digit });
    }

    pub fn resized(&self) {
        self.send(PanelEvent::Resized);
    }

    /// Emits [`PanelEvent::Remove`] unless it was already emitted.
    ///
    /// Returns `true` for the call that actually sent it.
    pub fn remove(&self) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(PanelEvent::Remove);
        true
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn send(&self, event: PanelEvent) {
        if self.is_removed() {
            debug!("dropping {event:?}: panel already removed");
            return;
        }
        // A closed receiver means nobody is listening any more; nothing to do.
        let _ = self.tx.send(event);
    }
}

/// The interface every driver implements.
///
/// Output methods never block: `draw` hands the item to the driver's
/// write-coalescing queue and returns.
#[async_trait]
pub trait SurfacePanel: Send + Sync {
    /// Current metadata.  May change once, after async initialisation.
    fn info(&self) -> PanelInfo;

    /// Addressable grid.  Only changes together with a `Resized` event.
    fn grid_size(&self) -> GridSize;

    /// Queues a redraw of one control.
    fn draw(&self, item: DrawItem);

    /// Queues several redraws.  Drivers whose wire protocol can update many
    /// keys in one frame override this.
    fn draw_many(&self, items: Vec<DrawItem>) {
        for item in items {
            self.draw(item);
        }
    }

    /// Blanks every output.  Best effort.
    async fn clear_deck(&self);

    /// Applies configuration.  `force` re-applies even when nothing changed.
    async fn set_config(&self, config: PanelConfig, force: bool);

    /// Shows or hides the pincode lock.
    fn set_locked(&self, _locked: bool, _character_count: usize) {}

    /// Host variables changed; panels bridging variables re-evaluate.
    fn on_variables_changed(&self, _changed: &HashSet<String>) {}

    /// Releases the device.  Idempotent.
    async fn quit(&self);
}

/// Why a panel could not be handed to the surface manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("device {0} exists elsewhere")]
    Duplicate(String),
}

/// Where freshly created panels go.
pub trait SurfaceSink: Send + Sync {
    /// Takes ownership of a new panel and its event stream.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Duplicate`] if a panel with the same device id
    /// is already attached.
    fn attach(&self, panel: Arc<dyn SurfacePanel>, events: PanelEvents) -> Result<(), AttachError>;
}

/// Turns the first queue error into a single `Remove`.
///
/// Queue processors only return errors for conditions that lose the device,
/// so there is nothing to retry at this level.
pub fn escalate_queue_errors<K>(
    device_id: String,
    mut errors: mpsc::UnboundedReceiver<QueueError<K>>,
    events: PanelEventSender,
) -> JoinHandle<()>
where
    K: Debug + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(QueueError { key, error }) = errors.recv().await {
            error!("{device_id}: writing {key:?} failed: {error}; removing panel");
            events.remove();
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
