//! HID transport abstraction.
//!
//! Drivers never touch a HID library directly.  They talk to a
//! [`HidTransport`], which has two implementations:
//!
//! - [`mock::MockHidTransport`] records writes and replays scripted input
//!   reports.  Used by unit and integration tests.
//! - `hidapi::HidApiTransport` (feature `hidapi`) wraps a real device.  The
//!   hidapi calls block, so they run on Tokio's blocking thread pool.
//!
//! # Retries
//!
//! Some decks silently drop a report now and then.  [`write_with_retry`]
//! tries a report [`WRITE_ATTEMPTS`] times, [`WRITE_RETRY_DELAY`] apart, and
//! only then gives up.  A report that still fails means the device is gone.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub mod mock;

#[cfg(feature = "hidapi")]
pub mod hidapi;

/// Attempts per report before a write counts as failed.
pub const WRITE_ATTEMPTS: u32 = 3;

/// Pause between write attempts.
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Error type for HID operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HidError {
    #[error("failed to open HID device {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("no HID device matches {vendor_id:04x}:{product_id:04x}")]
    NotFound { vendor_id: u16, product_id: u16 },
    #[error("HID write failed: {0}")]
    Write(String),
    #[error("HID read failed: {0}")]
    Read(String),
    #[error("HID device disconnected")]
    Disconnected,
    #[error("HID device already closed")]
    Closed,
}

/// An open HID device.
///
/// Methods take `&self` so one handle can be shared between a driver's
/// reader task and its write queue.  Only the owning driver uses it.
#[async_trait]
pub trait HidTransport: Send + Sync {
    /// Device path, for logs and as a fallback device id.
    fn path(&self) -> &str;

    /// Serial number reported by the device, if any.
    fn serial_number(&self) -> Option<String>;

    /// Writes one output report (report id included).
    async fn write(&self, report: &[u8]) -> Result<usize, HidError>;

    /// Reads one input report.  Returns `Ok(None)` when nothing arrived
    /// within `timeout`.
    async fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>, HidError>;

    /// Releases the device.  Idempotent.
    async fn close(&self);
}

/// Writes `report`, retrying up to [`WRITE_ATTEMPTS`] times.
///
/// # Errors
///
/// Returns the last [`HidError`] once every attempt failed.
pub async fn write_with_retry(transport: &dyn HidTransport, report: &[u8]) -> Result<(), HidError> {
    let mut attempt = 1;
    loop {
        match transport.write(report).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt >= WRITE_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!("{}: write attempt {attempt} failed: {e}", transport.path());
                attempt += 1;
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
