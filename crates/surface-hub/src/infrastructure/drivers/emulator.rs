//! In-process virtual panel.
//!
//! The emulator keeps the latest image of every cell in a flat cache indexed
//! by the cell's linear index and broadcasts every change to whoever is
//! watching (a local viewer, a test).  Viewers inject input with
//! [`EmulatorPanel::press`] and [`EmulatorPanel::rotate`].
//!
//! Changing the grid size through `set_config` replaces the cache and emits
//! `Resized`.  Draws queued for the old size are discarded: each job carries
//! the cache generation it was queued for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use surface_core::domain::config::{emulator_fields, lock_fields};
use surface_core::{
    index_from_xy, xy_from_index, CellKey, DrawItem, FamilyConfig, GridSize, PanelConfig, PanelInfo, RenderedImage,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::application::coalescing_queue::{CoalescingQueue, QueueProcessor};
use crate::application::panel::{escalate_queue_errors, PanelEventSender, PanelEvents, SurfaceError, SurfacePanel};

/// Buffered updates per viewer before a slow viewer starts missing some.
const VIEWER_BUFFER: usize = 256;

/// A change viewers should apply.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulatorUpdate {
    Image { column: u32, row: u32, image: RenderedImage },
    Cleared,
    Resized(GridSize),
    Locked { locked: bool, character_count: usize },
}

#[derive(Debug)]
struct ImageCache {
    grid: GridSize,
    generation: u64,
    cells: Vec<Option<RenderedImage>>,
}

impl ImageCache {
    fn new(grid: GridSize) -> Self {
        Self {
            grid,
            generation: 0,
            cells: vec![None; grid.cell_count()],
        }
    }

    fn resize(&mut self, grid: GridSize) {
        self.grid = grid;
        self.generation += 1;
        self.cells = vec![None; grid.cell_count()];
    }
}

struct CacheWriter {
    cache: Arc<Mutex<ImageCache>>,
    updates: broadcast::Sender<EmulatorUpdate>,
}

#[async_trait]
impl QueueProcessor<CellKey, (u64, RenderedImage)> for CacheWriter {
    async fn process(&self, key: CellKey, payload: (u64, RenderedImage)) -> Result<(), SurfaceError> {
        let (generation, image) = payload;
        {
            let mut cache = lock(&self.cache);
            if cache.generation != generation {
                debug!("dropping draw for {key} from an older grid");
                return Ok(());
            }
            let Some(index) = index_from_xy(key.column, key.row, cache.grid) else {
                return Ok(());
            };
            cache.cells[index] = Some(image.clone());
        }
        // No viewers is fine.
        let _ = self.updates.send(EmulatorUpdate::Image {
            column: key.column,
            row: key.row,
            image,
        });
        Ok(())
    }
}

fn lock(cache: &Mutex<ImageCache>) -> MutexGuard<'_, ImageCache> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

/// A virtual panel.
pub struct EmulatorPanel {
    info: PanelInfo,
    cache: Arc<Mutex<ImageCache>>,
    updates: broadcast::Sender<EmulatorUpdate>,
    draws: CoalescingQueue<CellKey, (u64, RenderedImage)>,
    events: PanelEventSender,
    config: Mutex<PanelConfig>,
    closed: AtomicBool,
}

impl EmulatorPanel {
    /// Creates an emulator with the given grid.  `0 x 0` is allowed.
    pub fn new(id: impl Into<String>, grid: GridSize) -> (Arc<Self>, PanelEvents) {
        let id = id.into();
        let (events, events_rx) = PanelEventSender::channel();
        let cache = Arc::new(Mutex::new(ImageCache::new(grid)));
        let (updates, _) = broadcast::channel(VIEWER_BUFFER);

        let (draws, errors) = CoalescingQueue::new(Arc::new(CacheWriter {
            cache: Arc::clone(&cache),
            updates: updates.clone(),
        }));
        escalate_queue_errors(id.clone(), errors, events.clone());

        let mut info = PanelInfo::new("Emulator", &id);
        info.config_fields = emulator_fields();
        info.config_fields.extend(lock_fields());
        info.capabilities.pincode_lock = true;

        info!("emulator {id} created with grid {grid}");
        let panel = Arc::new(Self {
            info,
            cache,
            updates,
            draws,
            events,
            config: Mutex::new(PanelConfig::new(FamilyConfig::Emulator {
                columns: grid.columns,
                rows: grid.rows,
            })),
            closed: AtomicBool::new(false),
        });
        (panel, events_rx)
    }

    fn lock_config(&self) -> MutexGuard<'_, PanelConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribes a viewer to future updates.
    pub fn subscribe(&self) -> broadcast::Receiver<EmulatorUpdate> {
        self.updates.subscribe()
    }

    /// Every cached image, in linear index order.
    pub fn snapshot(&self) -> Vec<(u32, u32, RenderedImage)> {
        let cache = lock(&self.cache);
        cache
            .cells
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| {
                let image = cell.clone()?;
                let (column, row) = xy_from_index(index, cache.grid)?;
                Some((column, row, image))
            })
            .collect()
    }

    /// Viewer pressed or released a key.  Ignored outside the grid.
    pub fn press(&self, column: u32, row: u32, pressed: bool) {
        if self.grid_size().contains(column, row) {
            self.events.click(column, row, pressed);
        } else {
            warn!("{}: press outside grid at {column}/{row}", self.info.device_id);
        }
    }

    /// Viewer turned an encoder.  Ignored outside the grid.
    pub fn rotate(&self, column: u32, row: u32, clockwise: bool) {
        if self.grid_size().contains(column, row) {
            self.events.rotate(column, row, clockwise);
        } else {
            warn!("{}: rotate outside grid at {column}/{row}", self.info.device_id);
        }
    }

    /// Viewer typed a pincode digit.
    pub fn pincode_key(&self, digit: u8) {
        self.events.pincode_key(digit);
    }
}

#[async_trait]
impl SurfacePanel for EmulatorPanel {
    fn info(&self) -> PanelInfo {
        self.info.clone()
    }

    fn grid_size(&self) -> GridSize {
        lock(&self.cache).grid
    }

    fn draw(&self, item: DrawItem) {
        if self.is_closed() {
            return;
        }
        let generation = {
            let cache = lock(&self.cache);
            if !cache.grid.contains(item.x, item.y) {
                return;
            }
            cache.generation
        };
        self.draws.queue(CellKey::new(item.y, item.x), (generation, item.image));
    }

    async fn clear_deck(&self) {
        if self.is_closed() {
            return;
        }
        lock(&self.cache).cells.iter_mut().for_each(|cell| *cell = None);
        let _ = self.updates.send(EmulatorUpdate::Cleared);
    }

    async fn set_config(&self, config: PanelConfig, _force: bool) {
        let (config, adjustments) = config.validated(&self.info.config_fields);
        for adjustment in &adjustments {
            warn!("{}: config {adjustment}", self.info.device_id);
        }
        let FamilyConfig::Emulator { columns, rows } = config.family else {
            warn!("{}: ignoring config for another panel family", self.info.device_id);
            return;
        };
        *self.lock_config() = config;

        let grid = GridSize::new(columns, rows);
        let resized = {
            let mut cache = lock(&self.cache);
            if cache.grid == grid {
                false
            } else {
                cache.resize(grid);
                true
            }
        };
        if resized {
            info!("{}: resized to {grid}", self.info.device_id);
            let _ = self.updates.send(EmulatorUpdate::Resized(grid));
            self.events.resized();
        }
    }

    fn set_locked(&self, locked: bool, character_count: usize) {
        let _ = self.updates.send(EmulatorUpdate::Locked {
            locked,
            character_count,
        });
    }

    async fn quit(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.draws.close();
            debug!("{}: emulator closed", self.info.device_id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::panel::PanelEvent;
    use std::time::Duration;
    use surface_core::{PixelBuffer, Rgb};
    use tokio::time::timeout;

    fn image(color: Rgb) -> RenderedImage {
        RenderedImage::new(PixelBuffer::solid(2, 2, color), Default::default())
    }

    #[tokio::test]
    async fn test_draw_is_cached_and_broadcast() {
        // Arrange
        let (panel, _events) = EmulatorPanel::new("emu", GridSize::new(3, 2));
        let mut viewer = panel.subscribe();

        // Act
        panel.draw(DrawItem::new(2, 1, image(Rgb::WHITE)));
        let update = timeout(Duration::from_secs(1), viewer.recv()).await.unwrap().unwrap();

        // Assert
        assert_eq!(
            update,
            EmulatorUpdate::Image {
                column: 2,
                row: 1,
                image: image(Rgb::WHITE)
            }
        );
        assert_eq!(panel.snapshot(), vec![(2, 1, image(Rgb::WHITE))]);
    }

    #[tokio::test]
    async fn test_zero_by_zero_grid_accepts_draw_and_clear() {
        let (panel, _events) = EmulatorPanel::new("empty", GridSize::new(0, 0));

        panel.draw(DrawItem::new(0, 0, image(Rgb::WHITE)));
        panel.clear_deck().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(panel.grid_size(), GridSize::new(0, 0));
        assert!(panel.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_resize_recreates_cache_and_emits_resized() {
        // Arrange
        let (panel, mut events) = EmulatorPanel::new("emu", GridSize::new(2, 2));
        let mut viewer = panel.subscribe();
        panel.draw(DrawItem::new(0, 0, image(Rgb::WHITE)));
        timeout(Duration::from_secs(1), viewer.recv()).await.unwrap().unwrap();

        // Act
        let config = PanelConfig::new(FamilyConfig::Emulator { columns: 4, rows: 1 });
        panel.set_config(config.clone(), false).await;
        panel.set_config(config, false).await;

        // Assert
        assert_eq!(panel.grid_size(), GridSize::new(4, 1));
        assert!(panel.snapshot().is_empty());
        assert_eq!(events.recv().await, Some(PanelEvent::Resized));
        assert!(events.try_recv().is_err());
        assert_eq!(viewer.recv().await.unwrap(), EmulatorUpdate::Resized(GridSize::new(4, 1)));
    }

    #[tokio::test]
    async fn test_viewer_input_outside_grid_is_ignored() {
        let (panel, mut events) = EmulatorPanel::new("emu", GridSize::new(2, 2));

        panel.press(5, 5, true);
        panel.press(1, 1, true);
        panel.rotate(0, 1, true);

        assert_eq!(
            events.recv().await,
            Some(PanelEvent::Click {
                column: 1,
                row: 1,
                pressed: true
            })
        );
        assert_eq!(
            events.recv().await,
            Some(PanelEvent::Rotate {
                column: 0,
                row: 1,
                clockwise: true
            })
        );
    }

    #[tokio::test]
    async fn test_clear_deck_empties_cache() {
        let (panel, _events) = EmulatorPanel::new("emu", GridSize::new(2, 2));
        let mut viewer = panel.subscribe();
        panel.draw(DrawItem::new(1, 0, image(Rgb::WHITE)));
        timeout(Duration::from_secs(1), viewer.recv()).await.unwrap().unwrap();

        panel.clear_deck().await;

        assert!(panel.snapshot().is_empty());
        assert_eq!(viewer.recv().await.unwrap(), EmulatorUpdate::Cleared);
    }
}
