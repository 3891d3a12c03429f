//! Panel drivers.
//!
//! Each driver adapts one device family to the [`SurfacePanel`] contract:
//!
//! - [`stream_dock`] – LCD key decks speaking the raw Stream Dock protocol.
//! - [`led_keypad`] – RGB backlit keypads without screens.
//! - [`emulator`] – an in-process virtual panel for development and demos.
//!
//! The remote Satellite session lives in the application layer because it
//! has no device handle of its own.
//!
//! # Two-phase start-up (for beginners)
//!
//! Opening a HID device and talking to it are separate steps.  A driver is
//! first *constructed* around an already-open handle, then `initialize()`
//! runs the handshake.  If the handshake fails the handle is closed before
//! the error is returned, so a half-initialised device is never leaked.
//!
//! # Shared HID plumbing
//!
//! [`HidLink`] is what both HID drivers share: it serialises multi-report
//! writes, retries them, and turns the first fatal failure into exactly one
//! `Remove`.  After that every write is refused without touching the handle.
//!
//! [`SurfacePanel`]: crate::application::panel::SurfacePanel

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::application::panel::{PanelEventSender, SurfaceError};
use crate::infrastructure::hid::{write_with_retry, HidError, HidTransport};

pub mod emulator;
pub mod led_keypad;
pub mod stream_dock;

/// How long one reader poll waits before checking for shutdown.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// A HID handle owned by one driver.
pub struct HidLink {
    device_id: String,
    hid: Arc<dyn HidTransport>,
    events: PanelEventSender,
    /// Held across a whole multi-report sequence.
    write_lock: AsyncMutex<()>,
    closed: AtomicBool,
}

impl HidLink {
    pub fn new(device_id: impl Into<String>, hid: Arc<dyn HidTransport>, events: PanelEventSender) -> Self {
        Self {
            device_id: device_id.into(),
            hid,
            events,
            write_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn events(&self) -> &PanelEventSender {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes `reports` back to back with nothing interleaved.
    ///
    /// The first report that fails after retries closes the link and emits
    /// `Remove`.
    ///
    /// # Errors
    ///
    /// [`SurfaceError::Closed`] if the link was already closed,
    /// [`SurfaceError::Device`] if this call lost the device.
    pub async fn send(&self, reports: &[Vec<u8>]) -> Result<(), SurfaceError> {
        let _guard = self.write_lock.lock().await;
        for report in reports {
            if self.is_closed() {
                return Err(SurfaceError::Closed);
            }
            if let Err(e) = write_with_retry(self.hid.as_ref(), report).await {
                self.fail(&e).await;
                return Err(SurfaceError::Device(e.to_string()));
            }
        }
        Ok(())
    }

    /// Like [`HidLink::send`] for a handshake: errors close the handle but
    /// emit nothing, since the panel was never announced.
    pub async fn send_during_init(&self, reports: &[Vec<u8>]) -> Result<(), SurfaceError> {
        let _guard = self.write_lock.lock().await;
        for report in reports {
            if let Err(e) = write_with_retry(self.hid.as_ref(), report).await {
                self.closed.store(true, Ordering::SeqCst);
                self.hid.close().await;
                return Err(SurfaceError::Initialize(e.to_string()));
            }
        }
        Ok(())
    }

    async fn fail(&self, e: &HidError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            error!("{}: lost device: {e}", self.device_id);
            self.hid.close().await;
            self.events.remove();
        }
    }

    /// Closes the handle without emitting `Remove`.  Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("{}: closing", self.device_id);
            self.hid.close().await;
        }
    }

    /// Spawns the input loop.  `on_report` sees every input report until the
    /// link closes or a read fails.
    pub fn spawn_reader<F>(self: &Arc<Self>, mut on_report: F) -> JoinHandle<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            while !link.is_closed() {
                match link.hid.read(READ_POLL).await {
                    Ok(Some(report)) => on_report(&report),
                    Ok(None) => {}
                    Err(e) => {
                        if !link.is_closed() {
                            link.fail(&e).await;
                        }
                        break;
                    }
                }
            }
            debug!("{}: reader stopped", link.device_id);
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
