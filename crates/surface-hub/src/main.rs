//! SurfaceHub entry point.
//!
//! Wires together the surface registry, the Satellite listener, configured
//! emulators and (with the `hidapi` feature) locally attached HID panels.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML settings, defaults on first run
//!  └─ SurfaceRegistry::new()   -- attached panels + hub-wide event channel
//!  └─ start services
//!       ├─ SatelliteServer     (accept loop task)
//!       ├─ EmulatorPanel       (one per [[emulators]] entry)
//!       ├─ StreamDockPanel / LedKeypadPanel (feature "hidapi")
//!       └─ event pump          (routes panel events)
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use surface_core::GridSize;
use surface_hub::application::host_variables::HostVariables;
use surface_hub::application::manage_surfaces::{attach_or_quit, route_event, SurfaceRegistry};
use surface_hub::infrastructure::drivers::emulator::EmulatorPanel;
use surface_hub::infrastructure::network::satellite_server::SatelliteServer;
use surface_hub::infrastructure::storage::config::{load_config, HubConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_error) = match load_config() {
        Ok(config) => (config, None),
        Err(e) => (HubConfig::default(), Some(e)),
    };

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.hub.log_level)),
        )
        .init();

    info!("SurfaceHub {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!("using default configuration: {e}");
    }

    let (registry, mut events) = SurfaceRegistry::new();
    let variables = Arc::new(HostVariables::new());
    let running = Arc::new(AtomicBool::new(true));

    // ── Satellite listener ────────────────────────────────────────────────────
    if config.satellite.enabled {
        let server_config = config.satellite.server_config(env!("CARGO_PKG_VERSION"))?;
        let server = SatelliteServer::bind(&server_config, Arc::new(registry.clone()), variables.clone()).await?;
        tokio::spawn(server.run(Arc::clone(&running)));
    }

    // ── Emulators ─────────────────────────────────────────────────────────────
    for entry in &config.emulators {
        let (panel, panel_events) = EmulatorPanel::new(&entry.id, GridSize::new(entry.columns, entry.rows));
        if let Err(e) = attach_or_quit(&registry, panel, panel_events).await {
            error!("emulator {}: {e}", entry.id);
        }
    }

    // ── HID panels ────────────────────────────────────────────────────────────
    #[cfg(feature = "hidapi")]
    {
        hid_panels::open_all(&config, &registry).await;
    }
    #[cfg(not(feature = "hidapi"))]
    {
        if !config.stream_docks.is_empty() || !config.led_keypads.is_empty() {
            warn!("HID panels configured but this build has no HID support (feature \"hidapi\")");
        }
    }

    // ── Event pump ────────────────────────────────────────────────────────────
    {
        let registry = registry.clone();
        let variables = Arc::clone(&variables);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                route_event(&registry, &variables, event);
            }
        });
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("SurfaceHub ready.  Press Ctrl-C to exit.");
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    registry.quit_all().await;
    info!("SurfaceHub stopped");
    Ok(())
}

#[cfg(feature = "hidapi")]
mod hid_panels {
    use std::sync::Arc;

    use tracing::error;

    use surface_hub::application::manage_surfaces::{attach_or_quit, SurfaceRegistry};
    use surface_hub::infrastructure::drivers::led_keypad::LedKeypadPanel;
    use surface_hub::infrastructure::drivers::stream_dock::StreamDockPanel;
    use surface_hub::infrastructure::hid::hidapi::HidApiTransport;
    use surface_hub::infrastructure::hid::HidTransport;
    use surface_hub::infrastructure::storage::config::HubConfig;

    /// Opens every configured HID panel.  Failures are logged per device.
    pub async fn open_all(config: &HubConfig, registry: &SurfaceRegistry) {
        for entry in &config.stream_docks {
            let (vendor_id, product_id) = entry.model.usb_ids();
            let transport = match &entry.path {
                Some(path) => HidApiTransport::open(path),
                None => HidApiTransport::open_first(vendor_id, product_id),
            };
            let hid: Arc<dyn HidTransport> = match transport {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    error!("{}: {e}", entry.model.name());
                    continue;
                }
            };
            match StreamDockPanel::open(hid, entry.model).await {
                Ok((panel, events)) => {
                    if let Err(e) = attach_or_quit(registry, panel, events).await {
                        error!("{}: {e}", entry.model.name());
                    }
                }
                Err(e) => error!("{}: {e}", entry.model.name()),
            }
        }

        for entry in &config.led_keypads {
            let hid: Arc<dyn HidTransport> = match HidApiTransport::open(&entry.path) {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    error!("{}: {e}", entry.model.name());
                    continue;
                }
            };
            match LedKeypadPanel::open(hid, entry.model).await {
                Ok((panel, events)) => {
                    if let Err(e) = attach_or_quit(registry, panel, events).await {
                        error!("{}: {e}", entry.model.name());
                    }
                }
                Err(e) => error!("{}: {e}", entry.model.name()),
            }
        }
    }
}
