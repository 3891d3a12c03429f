//! SurfaceRegistry: the hub's in-memory table of attached panels.
//!
//! Every driver factory and every Satellite `ADD-DEVICE` ends in
//! [`SurfaceSink::attach`].  The registry keeps the panel under its device id
//! and spawns a small pump task that forwards the panel's events, tagged with
//! the device id, onto one hub-wide channel.
//!
//! # Panel lifecycle (for beginners)
//!
//! ```text
//! attach ──► attached ──► Remove event ──► detached + quit()
//!                 │
//!                 └── quit_all() on shutdown
//! ```
//!
//! A panel that emits `Remove` is dropped from the table and `quit()` is
//! called on it, so the device id becomes free for a fresh instance (for
//! example after a Satellite client reconnects).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::host_variables::HostVariables;
use crate::application::panel::{AttachError, PanelEvent, PanelEvents, SurfacePanel, SurfaceSink};

/// An event from one attached panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    pub device_id: String,
    pub event: PanelEvent,
}

type PanelTable = HashMap<String, Arc<dyn SurfacePanel>>;

/// In-memory registry of attached panels.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SurfaceRegistry {
    panels: Arc<Mutex<PanelTable>>,
    events_tx: mpsc::UnboundedSender<SurfaceEvent>,
}

impl SurfaceRegistry {
    /// Creates an empty registry and the receiver for all panel events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                panels: Arc::new(Mutex::new(HashMap::new())),
                events_tx,
            },
            events_rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, PanelTable> {
        self.panels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<dyn SurfacePanel>> {
        self.lock().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.lock().contains_key(device_id)
    }

    /// Sorted ids of every attached panel.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tells every attached panel which host variables changed.
    pub fn notify_variables_changed(&self, changed: &HashSet<String>) {
        let panels: Vec<Arc<dyn SurfacePanel>> = self.lock().values().cloned().collect();
        for panel in panels {
            panel.on_variables_changed(changed);
        }
    }

    /// Detaches and quits every panel.
    pub async fn quit_all(&self) {
        let panels: Vec<(String, Arc<dyn SurfacePanel>)> = self.lock().drain().collect();
        for (device_id, panel) in panels {
            debug!("quitting {device_id}");
            panel.quit().await;
        }
    }
}

/// Attaches `panel`, or quits it when the sink refuses it.
///
/// A refused panel would otherwise keep its device handle and background
/// tasks alive with nobody left to close them.
///
/// # Errors
///
/// Returns the sink's [`AttachError`] after the panel has been quit.
pub async fn attach_or_quit(
    sink: &dyn SurfaceSink,
    panel: Arc<dyn SurfacePanel>,
    events: PanelEvents,
) -> Result<(), AttachError> {
    match sink.attach(Arc::clone(&panel), events) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("{}: {e}; releasing the device", panel.info().device_id);
            panel.quit().await;
            Err(e)
        }
    }
}

/// Hub-side reaction to one panel event.
///
/// Input is only logged: page and action handling live outside the hub.
/// Custom variable pushes update `variables`, and a real change is fanned
/// out to every panel so bound output variables re-evaluate.
pub fn route_event(registry: &SurfaceRegistry, variables: &HostVariables, event: SurfaceEvent) {
    let SurfaceEvent { device_id, event } = event;
    match event {
        PanelEvent::Click { column, row, pressed } => {
            info!("{device_id}: {} at {column}/{row}", if pressed { "press" } else { "release" });
        }
        PanelEvent::Rotate { column, row, clockwise } => {
            info!("{device_id}: rotate {} at {column}/{row}", if clockwise { "right" } else { "left" });
        }
        PanelEvent::SetCustomVariable { name, value } => {
            debug!("{device_id}: custom variable {name} = {value:?}");
            if variables.set(name.clone(), serde_json::Value::String(value)) {
                registry.notify_variables_changed(&HashSet::from([name]));
            }
        }
        PanelEvent::PincodeKey { digit } => debug!("{device_id}: pincode digit {digit}"),
        PanelEvent::Resized => {
            if let Some(panel) = registry.get(&device_id) {
                info!("{device_id}: grid is now {}", panel.grid_size());
            }
        }
        PanelEvent::Remove => info!("{device_id}: removed"),
    }
}

impl SurfaceSink for SurfaceRegistry {
    fn attach(&self, panel: Arc<dyn SurfacePanel>, mut events: PanelEvents) -> Result<(), AttachError> {
        let device_id = panel.info().device_id;
        {
            let mut panels = self.lock();
            if panels.contains_key(&device_id) {
                warn!("rejecting {device_id}: already attached");
                return Err(AttachError::Duplicate(device_id));
            }
            panels.insert(device_id.clone(), Arc::clone(&panel));
        }
        info!("attached {} ({device_id}), grid {}", panel.info().type_name, panel.grid_size());

        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let removed = event == PanelEvent::Remove;
                let _ = registry.events_tx.send(SurfaceEvent {
                    device_id: device_id.clone(),
                    event,
                });
                if removed {
                    break;
                }
            }

            // Either Remove arrived or the driver dropped its sender.
            let detached = {
                let mut panels = registry.lock();
                match panels.get(&device_id) {
                    Some(current) if Arc::ptr_eq(current, &panel) => panels.remove(&device_id),
                    _ => None,
                }
            };
            if detached.is_some() {
                info!("detached {device_id}");
                panel.quit().await;
            }
        });

        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
