//! In-memory [`HidTransport`] for tests.
//!
//! Input reports are queued with [`MockHidTransport::queue_read`]; every
//! successful write is kept in a history that tests can inspect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{HidError, HidTransport};

#[derive(Debug, Default)]
struct MockState {
    read_queue: VecDeque<Vec<u8>>,
    write_history: Vec<Vec<u8>>,
    failing_writes: usize,
}

/// Scriptable HID device.
#[derive(Debug)]
pub struct MockHidTransport {
    path: String,
    serial: Option<String>,
    state: Mutex<MockState>,
    input: Notify,
    write_attempts: AtomicUsize,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MockHidTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            serial: None,
            state: Mutex::new(MockState::default()),
            input: Notify::new(),
            write_attempts: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues an input report for the next `read`.
    pub fn queue_read(&self, report: Vec<u8>) {
        self.lock().read_queue.push_back(report);
        self.input.notify_one();
    }

    /// Every report written successfully, oldest first.
    pub fn write_history(&self) -> Vec<Vec<u8>> {
        self.lock().write_history.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().write_history.len()
    }

    /// Write calls including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn clear_write_history(&self) {
        self.lock().write_history.clear();
    }

    /// Makes the next `count` writes fail with [`HidError::Write`].
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Simulates unplugging: every later read and write fails.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.input.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HidTransport for MockHidTransport {
    fn path(&self) -> &str {
        &self.path
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    async fn write(&self, report: &[u8]) -> Result<usize, HidError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(HidError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HidError::Disconnected);
        }
        let mut state = self.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(HidError::Write("scripted failure".to_string()));
        }
        state.write_history.push(report.to_vec());
        Ok(report.len())
    }

    async fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>, HidError> {
        let wait = async {
            loop {
                let notified = self.input.notified();
                if self.is_closed() {
                    return Err(HidError::Closed);
                }
                if !self.connected.load(Ordering::SeqCst) {
                    return Err(HidError::Disconnected);
                }
                if let Some(report) = self.lock().read_queue.pop_front() {
                    return Ok(report);
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.input.notify_waiters();
    }
}
