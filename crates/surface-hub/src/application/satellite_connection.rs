//! SatelliteConnection: dispatches the inbound lines of one connection.
//!
//! A single Satellite connection can host several devices.  This type owns
//! the connection-level state (which device ids were added here) and turns
//! each parsed [`SatelliteCommand`] into a call on the right
//! [`SatelliteSession`] or into a direct reply.
//!
//! Lines are handled strictly one after another by the connection's reader
//! loop, so the press/release order of a control is the order the client
//! sent them in.
//!
//! Nothing a client sends can break the connection: malformed lines and
//! unknown commands are logged and answered with `ERROR`.

use std::collections::HashMap;
use std::sync::Arc;

use surface_core::protocol::{parse_command, parse_line, AddDeviceRequest, ProtocolError};
use surface_core::{SatelliteCommand, SatelliteMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::panel::{SurfacePanel, SurfaceSink};
use crate::application::satellite_session::SatelliteSession;
use crate::application::variable_bridge::ExpressionEvaluator;

/// Reply sent when a device id is already attached.
pub const DEVICE_EXISTS_MESSAGE: &str = "Device exists elsewhere";

/// What the reader loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// The client sent `QUIT`.
    Quit,
}

pub struct SatelliteConnection {
    label: String,
    sink: Arc<dyn SurfaceSink>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    outbound: mpsc::UnboundedSender<SatelliteMessage>,
    sessions: HashMap<String, Arc<SatelliteSession>>,
}

impl SatelliteConnection {
    /// `label` only appears in logs.
    pub fn new(
        label: impl Into<String>,
        sink: Arc<dyn SurfaceSink>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        outbound: mpsc::UnboundedSender<SatelliteMessage>,
    ) -> Self {
        Self {
            label: label.into(),
            sink,
            evaluator,
            outbound,
            sessions: HashMap::new(),
        }
    }

    /// Device ids added on this connection, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn reply(&self, message: SatelliteMessage) {
        let _ = self.outbound.send(message);
    }

    fn error(&self, message: impl Into<String>) {
        self.reply(SatelliteMessage::Error {
            message: message.into(),
        });
    }

    fn session(&self, device_id: &str) -> Option<&Arc<SatelliteSession>> {
        let session = self.sessions.get(device_id);
        if session.is_none() {
            warn!("{}: command for unknown device {device_id}", self.label);
            self.error(format!("Device not found: {device_id}"));
        }
        session
    }

    /// Handles one inbound line.
    pub async fn handle_line(&mut self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Continue;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}: ignoring malformed line {line:?}: {e}", self.label);
                self.reject(line, e);
                return LineOutcome::Continue;
            }
        };

        match command {
            SatelliteCommand::Ping(payload) => self.reply(SatelliteMessage::Pong(payload)),
            SatelliteCommand::Pong(_) => {}
            SatelliteCommand::Quit => {
                info!("{}: client quit", self.label);
                return LineOutcome::Quit;
            }
            SatelliteCommand::AddDevice(request) => self.add_device(*request).await,
            SatelliteCommand::RemoveDevice { device_id } => self.remove_device(device_id),
            SatelliteCommand::KeyPress {
                device_id,
                control,
                pressed,
            } => {
                if let Some(session) = self.session(&device_id) {
                    session.handle_key_press(&control, pressed);
                }
            }
            SatelliteCommand::KeyRotate {
                device_id,
                control,
                clockwise,
            } => {
                if let Some(session) = self.session(&device_id) {
                    session.handle_key_rotate(&control, clockwise);
                }
            }
            SatelliteCommand::PincodeKey { device_id, digit } => {
                if let Some(session) = self.session(&device_id) {
                    session.handle_pincode_key(digit);
                }
            }
            SatelliteCommand::SetVariableValue {
                device_id,
                variable,
                value,
            } => {
                if let Some(session) = self.session(&device_id) {
                    session.handle_set_variable(&variable, &value);
                }
            }
            SatelliteCommand::Unknown { name } => {
                debug!("{}: unknown command {name}", self.label);
                self.error(format!("Unknown command: {name}"));
            }
        }
        LineOutcome::Continue
    }

    /// Answers a line that failed to parse.
    ///
    /// A refused `ADD-DEVICE` that still names its device gets
    /// `ADD-DEVICE ERROR`, so the client knows which device was turned down.
    fn reject(&self, line: &str, error: ProtocolError) {
        let refused_device = match parse_line(line) {
            Ok((name, params)) if name == "ADD-DEVICE" => params.get("DEVICEID").map(str::to_string),
            _ => None,
        };
        match refused_device {
            Some(device_id) => self.reply(SatelliteMessage::AddDeviceError {
                device_id,
                message: error.to_string(),
            }),
            None => self.error(error.to_string()),
        }
    }

    async fn add_device(&mut self, request: AddDeviceRequest) {
        let device_id = request.device_id.clone();
        if self.sessions.contains_key(&device_id) {
            warn!("{}: {device_id} added twice", self.label);
            self.reply(SatelliteMessage::AddDeviceError {
                device_id,
                message: DEVICE_EXISTS_MESSAGE.to_string(),
            });
            return;
        }

        let (session, events) = SatelliteSession::new(&request, self.outbound.clone(), Arc::clone(&self.evaluator));
        let panel: Arc<dyn SurfacePanel> = session.clone();
        match self.sink.attach(panel, events) {
            Ok(()) => {
                session.activate();
                info!("{}: added {device_id} ({})", self.label, request.product_name);
                self.sessions.insert(device_id.clone(), session);
                self.reply(SatelliteMessage::AddDeviceOk { device_id });
            }
            Err(e) => {
                warn!("{}: rejecting {device_id}: {e}", self.label);
                session.quit().await;
                self.reply(SatelliteMessage::AddDeviceError {
                    device_id,
                    message: DEVICE_EXISTS_MESSAGE.to_string(),
                });
            }
        }
    }

    fn remove_device(&mut self, device_id: String) {
        match self.sessions.remove(&device_id) {
            Some(session) => {
                session.remove();
                self.reply(SatelliteMessage::RemoveDeviceOk { device_id });
            }
            None => {
                warn!("{}: REMOVE-DEVICE for unknown device {device_id}", self.label);
                self.error(format!("Device not found: {device_id}"));
            }
        }
    }

    /// The connection is gone: every device on it is removed.
    pub fn close(&mut self) {
        for (device_id, session) in self.sessions.drain() {
            debug!("{}: removing {device_id} on disconnect", self.label);
            session.remove();
        }
    }
}

impl Drop for SatelliteConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
