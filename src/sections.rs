//! Sharded section workers
//!
//! The coordinate space is partitioned into fixed rectangles; every
//! rectangle is owned by exactly one background worker, picked
//! deterministically from the coordinates, so producers route updates
//! without coordination and no two updates to the same section cache ever
//! execute concurrently. Each worker drains its FIFO strictly one item at
//! a time and acknowledges completion through a correlation id.
//!
//! Patches are written to the durable section queue before the in-memory
//! send, and acknowledged (marked done) after the section write, giving
//! at-least-once delivery across worker crashes: `recover_pending` replays
//! undone rows on startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::error::{CanvasError, Result};

const QUEUE_CAPACITY: usize = 1024;
const ACK_WATCHDOG: Duration = Duration::from_secs(5);

/// Section partitioning of a `width x height` grid into `edge x edge`
/// rectangles (border sections may be narrower).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionGeometry {
    pub width: u32,
    pub height: u32,
    pub edge: u32,
}

impl SectionGeometry {
    pub fn new(width: u32, height: u32, edge: u32) -> Self {
        Self {
            width,
            height,
            edge: edge.max(1),
        }
    }

    pub fn cols(&self) -> u32 {
        self.width.div_ceil(self.edge)
    }

    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.edge)
    }

    pub fn section_count(&self) -> u32 {
        self.cols() * self.rows()
    }

    pub fn section_of(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || (x as u32) >= self.width || (y as u32) >= self.height {
            return None;
        }
        Some((y as u32 / self.edge) * self.cols() + x as u32 / self.edge)
    }

    /// Section rectangle as (x0, y0, w, h).
    pub fn section_rect(&self, section: u32) -> (i32, i32, u32, u32) {
        let col = section % self.cols();
        let row = section / self.cols();
        let x0 = col * self.edge;
        let y0 = row * self.edge;
        let w = self.edge.min(self.width - x0);
        let h = self.edge.min(self.height - y0);
        (x0 as i32, y0 as i32, w, h)
    }

    /// Offset of (x, y) inside its owning section's local array.
    pub fn local_offset(&self, section: u32, x: i32, y: i32) -> usize {
        let (x0, y0, w, _) = self.section_rect(section);
        (y - y0) as usize * w as usize + (x - x0) as usize
    }

    /// Deterministic worker ownership: all coordinates of one section hash
    /// to the same worker, preserving per-section write exclusivity.
    pub fn worker_of(&self, x: i32, y: i32, worker_count: usize) -> Option<usize> {
        self.section_of(x, y)
            .map(|section| section as usize % worker_count.max(1))
    }
}

struct SectionEntry {
    cells: Vec<i32>,
    expires_at: Instant,
}

enum SectionJob {
    Patch {
        queue_id: Option<i64>,
        x: i32,
        y: i32,
        color_id: i32,
        correlation: u64,
        ack: Option<oneshot::Sender<u64>>,
    },
    Rebuild {
        section: u32,
        correlation: u64,
        ack: Option<oneshot::Sender<u64>>,
    },
}

struct WorkerCtx {
    db: Arc<Database>,
    cache: Arc<DashMap<u32, SectionEntry>>,
    geometry: Arc<RwLock<SectionGeometry>>,
    ttl: Duration,
}

pub struct SectionPool {
    db: Arc<Database>,
    cache: Arc<DashMap<u32, SectionEntry>>,
    geometry: Arc<RwLock<SectionGeometry>>,
    senders: Vec<mpsc::Sender<SectionJob>>,
    correlation: AtomicU64,
    ttl: Duration,
}

impl SectionPool {
    pub fn new(
        db: Arc<Database>,
        geometry: SectionGeometry,
        worker_count: usize,
        ttl: Duration,
    ) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let cache = Arc::new(DashMap::new());
        let geometry = Arc::new(RwLock::new(geometry));

        let mut senders = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            let ctx = WorkerCtx {
                db: db.clone(),
                cache: cache.clone(),
                geometry: geometry.clone(),
                ttl,
            };
            tokio::spawn(worker_loop(worker_id, rx, ctx));
            senders.push(tx);
        }
        info!("Started {} section workers", worker_count);

        Arc::new(Self {
            db,
            cache,
            geometry,
            senders,
            correlation: AtomicU64::new(0),
            ttl,
        })
    }

    pub fn geometry(&self) -> SectionGeometry {
        *self.geometry.read().expect("geometry lock poisoned")
    }

    /// Swap in a new grid geometry (canvas resize) and drop all cached
    /// sections; they rebuild lazily from the store.
    pub fn reconfigure(&self, geometry: SectionGeometry) {
        *self.geometry.write().expect("geometry lock poisoned") = geometry;
        self.cache.clear();
    }

    /// Durably enqueue a patch and hand it to the owning worker without
    /// blocking on worker availability. The acknowledgement is watched in
    /// the background; a missed watchdog is logged and abandoned, never
    /// retried inline (the durable queue row stays pending for recovery).
    pub async fn submit_patch(&self, x: i32, y: i32, color_id: i32) -> Result<()> {
        let queue_id = self.db.enqueue_section_patch(x, y, color_id).await?;
        let (tx, rx) = oneshot::channel();
        let correlation = self.route_patch(Some(queue_id), x, y, color_id, Some(tx))?;

        tokio::spawn(async move {
            match timeout(ACK_WATCHDOG, rx).await {
                Ok(Ok(_)) => {}
                _ => error!(
                    "Section worker did not acknowledge patch {} at ({}, {}) within {:?}",
                    correlation, x, y, ACK_WATCHDOG
                ),
            }
        });
        Ok(())
    }

    /// Like [`submit_patch`] but waits for the worker's acknowledgement;
    /// used by replay and by callers that need completion ordering.
    pub async fn apply_patch(&self, x: i32, y: i32, color_id: i32) -> Result<u64> {
        let queue_id = self.db.enqueue_section_patch(x, y, color_id).await?;
        let (tx, rx) = oneshot::channel();
        let correlation = self.route_patch(Some(queue_id), x, y, color_id, Some(tx))?;
        match timeout(ACK_WATCHDOG, rx).await {
            Ok(Ok(id)) => Ok(id),
            _ => Err(CanvasError::Worker(format!(
                "patch {correlation} not acknowledged within {ACK_WATCHDOG:?}"
            ))),
        }
    }

    fn route_patch(
        &self,
        queue_id: Option<i64>,
        x: i32,
        y: i32,
        color_id: i32,
        ack: Option<oneshot::Sender<u64>>,
    ) -> Result<u64> {
        let geometry = self.geometry();
        let worker = geometry
            .worker_of(x, y, self.senders.len())
            .ok_or_else(|| CanvasError::Worker(format!("coordinate ({x}, {y}) out of grid")))?;
        let correlation = self.correlation.fetch_add(1, Ordering::Relaxed) + 1;
        let job = SectionJob::Patch {
            queue_id,
            x,
            y,
            color_id,
            correlation,
            ack,
        };
        self.senders[worker].try_send(job).map_err(|_| {
            warn!("Section worker {} queue full, patch stays pending", worker);
            CanvasError::Worker(format!("worker {worker} queue full"))
        })?;
        Ok(correlation)
    }

    /// Rebuild one section from the Placement Store through its owning
    /// worker; the unit of recovery after a crash or cold start.
    pub async fn cache_section(&self, section: u32) -> Result<()> {
        let geometry = self.geometry();
        if section >= geometry.section_count() {
            return Err(CanvasError::Worker(format!("section {section} out of range")));
        }
        let worker = section as usize % self.senders.len();
        let correlation = self.correlation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let job = SectionJob::Rebuild {
            section,
            correlation,
            ack: Some(tx),
        };
        self.senders[worker]
            .try_send(job)
            .map_err(|_| CanvasError::Worker(format!("worker {worker} queue full")))?;
        match timeout(ACK_WATCHDOG, rx).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(CanvasError::Worker(format!(
                "section {section} rebuild not acknowledged"
            ))),
        }
    }

    /// Replay unacknowledged durable-queue rows, in enqueue order. Called
    /// once at startup before the service accepts placements.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.db.pending_section_patches().await?;
        let count = pending.len();
        for row in pending {
            let (tx, rx) = oneshot::channel();
            match self.route_patch(Some(row.id), row.x, row.y, row.color_id, Some(tx)) {
                Ok(_) => {
                    // Replay is sequential so the queues cannot overflow.
                    let _ = timeout(ACK_WATCHDOG, rx).await;
                }
                Err(e) => warn!("Skipping unrecoverable queue row {}: {}", row.id, e),
            }
        }
        if count > 0 {
            info!("Replayed {} pending section patches", count);
        }
        Ok(count)
    }

    /// Row-major concatenation of all section caches: the bulk-read path.
    /// Sections absent or expired are rebuilt inline from the store.
    pub async fn assemble_full(&self) -> Result<Vec<i32>> {
        let geometry = self.geometry();
        let mut cells =
            vec![crate::config::EMPTY_COLOR; geometry.width as usize * geometry.height as usize];
        for section in 0..geometry.section_count() {
            let (x0, y0, w, h) = geometry.section_rect(section);
            let local = match self.cache.get(&section) {
                Some(entry) if entry.expires_at > Instant::now() => entry.cells.clone(),
                _ => {
                    let built = self.db.section_colors(x0, y0, w, h).await?;
                    self.cache.insert(
                        section,
                        SectionEntry {
                            cells: built.clone(),
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                    built
                }
            };
            for ly in 0..h as usize {
                let src = ly * w as usize;
                let dst = (y0 as usize + ly) * geometry.width as usize + x0 as usize;
                cells[dst..dst + w as usize].copy_from_slice(&local[src..src + w as usize]);
            }
        }
        Ok(cells)
    }

    /// Current color of one cell through the section tier (test and
    /// diagnostics hook).
    pub fn cached_color(&self, x: i32, y: i32) -> Option<i32> {
        let geometry = self.geometry();
        let section = geometry.section_of(x, y)?;
        let entry = self.cache.get(&section)?;
        entry
            .cells
            .get(geometry.local_offset(section, x, y))
            .copied()
    }
}

async fn worker_loop(worker_id: usize, mut rx: mpsc::Receiver<SectionJob>, ctx: WorkerCtx) {
    debug!("Section worker {} started", worker_id);
    while let Some(job) = rx.recv().await {
        match job {
            SectionJob::Patch {
                queue_id,
                x,
                y,
                color_id,
                correlation,
                ack,
            } => {
                if let Err(e) = apply_patch_job(&ctx, queue_id, x, y, color_id).await {
                    error!(
                        "Section worker {} failed to apply patch at ({}, {}): {}",
                        worker_id, x, y, e
                    );
                    continue;
                }
                if let Some(ack) = ack {
                    let _ = ack.send(correlation);
                }
            }
            SectionJob::Rebuild {
                section,
                correlation,
                ack,
            } => {
                if let Err(e) = rebuild_section(&ctx, section).await {
                    error!(
                        "Section worker {} failed to rebuild section {}: {}",
                        worker_id, section, e
                    );
                    continue;
                }
                if let Some(ack) = ack {
                    let _ = ack.send(correlation);
                }
            }
        }
    }
    debug!("Section worker {} stopped", worker_id);
}

async fn apply_patch_job(
    ctx: &WorkerCtx,
    queue_id: Option<i64>,
    x: i32,
    y: i32,
    color_id: i32,
) -> Result<()> {
    let geometry = *ctx.geometry.read().expect("geometry lock poisoned");
    let Some(section) = geometry.section_of(x, y) else {
        // Stale patch after a resize; drop it but clear the queue row.
        if let Some(id) = queue_id {
            ctx.db.ack_section_patch(id).await?;
        }
        return Ok(());
    };

    let fresh = match ctx.cache.get(&section) {
        Some(entry) if entry.expires_at > Instant::now() => None,
        _ => {
            let (x0, y0, w, h) = geometry.section_rect(section);
            Some(ctx.db.section_colors(x0, y0, w, h).await?)
        }
    };

    let offset = geometry.local_offset(section, x, y);
    match fresh {
        Some(mut cells) => {
            cells[offset] = color_id;
            ctx.cache.insert(
                section,
                SectionEntry {
                    cells,
                    expires_at: Instant::now() + ctx.ttl,
                },
            );
        }
        None => {
            if let Some(mut entry) = ctx.cache.get_mut(&section) {
                entry.cells[offset] = color_id;
            }
        }
    }

    if let Some(id) = queue_id {
        ctx.db.ack_section_patch(id).await?;
    }
    Ok(())
}

async fn rebuild_section(ctx: &WorkerCtx, section: u32) -> Result<()> {
    let geometry = *ctx.geometry.read().expect("geometry lock poisoned");
    let (x0, y0, w, h) = geometry.section_rect(section);
    let cells = ctx.db.section_colors(x0, y0, w, h).await?;
    ctx.cache.insert(
        section,
        SectionEntry {
            cells,
            expires_at: Instant::now() + ctx.ttl,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EMPTY_COLOR;
    use chrono::Utc;

    fn geometry() -> SectionGeometry {
        SectionGeometry::new(250, 120, 100)
    }

    #[test]
    fn section_partitioning_is_row_major() {
        let g = geometry();
        assert_eq!(g.cols(), 3);
        assert_eq!(g.rows(), 2);
        assert_eq!(g.section_of(0, 0), Some(0));
        assert_eq!(g.section_of(249, 0), Some(2));
        assert_eq!(g.section_of(100, 100), Some(4));
        assert_eq!(g.section_of(250, 0), None);

        // Border sections shrink to the grid edge.
        assert_eq!(g.section_rect(2), (200, 0, 50, 100));
        assert_eq!(g.section_rect(5), (200, 100, 50, 20));
    }

    #[test]
    fn all_cells_of_a_section_share_a_worker() {
        let g = geometry();
        let w = g.worker_of(210, 10, 4).unwrap();
        assert_eq!(g.worker_of(249, 99, 4), Some(w));
        assert_ne!(g.section_of(210, 10), g.section_of(210, 110));
    }

    async fn test_pool(workers: usize) -> (Arc<Database>, Arc<SectionPool>) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        db.ensure_schema().await.unwrap();
        db.set_canvas_size(250, 120).await.unwrap();
        let pool = SectionPool::new(
            db.clone(),
            SectionGeometry::new(250, 120, 100),
            workers,
            Duration::from_secs(300),
        );
        (db, pool)
    }

    #[tokio::test]
    async fn patches_to_distinct_sections_converge() {
        let (_db, pool) = test_pool(3).await;

        // Interleave updates across four different sections.
        let updates = [(5, 5, 1), (205, 5, 2), (5, 105, 3), (205, 105, 4)];
        for (x, y, color) in updates {
            pool.apply_patch(x, y, color).await.unwrap();
        }
        for (x, y, color) in updates.iter().rev() {
            pool.apply_patch(*x, *y, *color).await.unwrap();
        }

        for (x, y, color) in updates {
            assert_eq!(pool.cached_color(x, y), Some(color));
        }
    }

    #[tokio::test]
    async fn assembled_canvas_matches_store_fold() {
        let (db, pool) = test_pool(2).await;
        db.ensure_user("carol", 6, Utc::now()).await.unwrap();
        for (x, y, color) in [(0, 0, 1), (120, 30, 2), (249, 119, 3)] {
            db.insert_placement("carol", x, y, color, Utc::now(), None)
                .await
                .unwrap();
        }

        let assembled = pool.assemble_full().await.unwrap();
        let folded = db.latest_colors(250, 120).await.unwrap();
        assert_eq!(assembled, folded);
        assert_eq!(assembled[119 * 250 + 249], 3);
    }

    #[tokio::test]
    async fn pending_queue_rows_replay_on_startup() {
        let (db, pool) = test_pool(2).await;
        db.enqueue_section_patch(10, 10, 7).await.unwrap();
        db.enqueue_section_patch(110, 10, 8).await.unwrap();

        let replayed = pool.recover_pending().await.unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(pool.cached_color(10, 10), Some(7));
        assert_eq!(pool.cached_color(110, 10), Some(8));
        assert!(db.pending_section_patches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acked_patch_clears_durable_row() {
        let (db, pool) = test_pool(1).await;
        pool.apply_patch(3, 3, 9).await.unwrap();
        assert!(db.pending_section_patches().await.unwrap().is_empty());
        assert_eq!(pool.cached_color(3, 3), Some(9));
        assert_eq!(pool.cached_color(4, 3), Some(EMPTY_COLOR));
    }
}
