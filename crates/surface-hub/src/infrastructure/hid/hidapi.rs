//! [`HidTransport`] backed by the `hidapi` crate.
//!
//! hidapi calls block the calling thread, so every call runs inside
//! `spawn_blocking`.  Reads poll in short slices so a pending read never
//! holds the device lock long enough to stall a write.

use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{HidError, HidTransport};

/// Longest single `read_timeout` call.
const READ_SLICE_MS: i32 = 50;

/// Input reports are never larger than this.
const READ_BUFFER_LEN: usize = 1024;

/// One device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceEntry {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

/// Lists every HID device with the given USB ids.
///
/// Composite devices expose several interfaces; each path appears once.
///
/// # Errors
///
/// Returns [`HidError::Open`] if the HID subsystem cannot be initialised.
pub fn enumerate(vendor_id: u16, product_id: u16) -> Result<Vec<HidDeviceEntry>, HidError> {
    let api = ::hidapi::HidApi::new().map_err(|e| HidError::Open {
        path: "<hidapi>".to_string(),
        reason: e.to_string(),
    })?;
    let mut entries: Vec<HidDeviceEntry> = Vec::new();
    for device in api.device_list() {
        if device.vendor_id() != vendor_id || device.product_id() != product_id {
            continue;
        }
        let path = device.path().to_string_lossy().into_owned();
        if entries.iter().any(|e| e.path == path) {
            continue;
        }
        entries.push(HidDeviceEntry {
            path,
            vendor_id,
            product_id,
            serial_number: device.serial_number().map(str::to_string),
        });
    }
    Ok(entries)
}

/// A real HID device.
pub struct HidApiTransport {
    path: String,
    serial: Option<String>,
    device: Arc<Mutex<Option<::hidapi::HidDevice>>>,
}

fn lock_device(
    device: &Mutex<Option<::hidapi::HidDevice>>,
) -> MutexGuard<'_, Option<::hidapi::HidDevice>> {
    device.lock().unwrap_or_else(|e| e.into_inner())
}

impl HidApiTransport {
    /// Opens the device at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HidError::Open`] if the path is invalid or the device
    /// cannot be opened (missing permissions, already claimed).
    pub fn open(path: &str) -> Result<Self, HidError> {
        let open_err = |reason: String| HidError::Open {
            path: path.to_string(),
            reason,
        };
        let api = ::hidapi::HidApi::new().map_err(|e| open_err(e.to_string()))?;
        let c_path = CString::new(path).map_err(|e| open_err(e.to_string()))?;
        let device = api.open_path(&c_path).map_err(|e| open_err(e.to_string()))?;
        let serial = device.get_serial_number_string().ok().flatten();
        info!("opened HID device {path} (serial {serial:?})");
        Ok(Self {
            path: path.to_string(),
            serial,
            device: Arc::new(Mutex::new(Some(device))),
        })
    }

    /// Opens the first device with the given USB ids.
    ///
    /// # Errors
    ///
    /// Returns [`HidError::NotFound`] when nothing matches.
    pub fn open_first(vendor_id: u16, product_id: u16) -> Result<Self, HidError> {
        let entry = enumerate(vendor_id, product_id)?
            .into_iter()
            .next()
            .ok_or(HidError::NotFound { vendor_id, product_id })?;
        Self::open(&entry.path)
    }
}

#[async_trait]
impl HidTransport for HidApiTransport {
    fn path(&self) -> &str {
        &self.path
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    async fn write(&self, report: &[u8]) -> Result<usize, HidError> {
        let device = Arc::clone(&self.device);
        let report = report.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = lock_device(&device);
            let dev = guard.as_ref().ok_or(HidError::Closed)?;
            dev.write(&report).map_err(|e| HidError::Write(e.to_string()))
        })
        .await
        .map_err(|e| HidError::Write(e.to_string()))?
    }

    async fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>, HidError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let device = Arc::clone(&self.device);
            let slice = READ_SLICE_MS.min(timeout.as_millis().try_into().unwrap_or(i32::MAX));
            let got = tokio::task::spawn_blocking(move || {
                let guard = lock_device(&device);
                let dev = guard.as_ref().ok_or(HidError::Closed)?;
                let mut buf = vec![0u8; READ_BUFFER_LEN];
                let n = dev
                    .read_timeout(&mut buf, slice)
                    .map_err(|e| HidError::Read(e.to_string()))?;
                buf.truncate(n);
                Ok::<_, HidError>(buf)
            })
            .await
            .map_err(|e| HidError::Read(e.to_string()))??;

            if !got.is_empty() {
                return Ok(Some(got));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn close(&self) {
        if lock_device(&self.device).take().is_some() {
            debug!("closed HID device {}", self.path);
        }
    }
}
