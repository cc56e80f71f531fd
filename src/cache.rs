//! Canvas snapshot cache
//!
//! A flat, versioned, TTL-bounded cache of "current color per cell" for the
//! whole grid. Reads return the cached array when fresh and otherwise
//! rebuild synchronously from the Placement Store. The cached array is held
//! behind an `Arc` and replaced whole, never mutated in place, so a reader
//! racing a rebuild sees either the prior array or the finished one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::database::Database;
use crate::error::Result;

/// An immutable view of the cached canvas at some version.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    pub version: u64,
    pub width: u32,
    pub height: u32,
    pub cells: Arc<Vec<i32>>,
}

struct CachedSnapshot {
    view: SnapshotView,
    expires_at: Instant,
}

pub struct SnapshotCache {
    db: Arc<Database>,
    ttl: Duration,
    default_width: u32,
    default_height: u32,
    inner: RwLock<Option<CachedSnapshot>>,
    version: AtomicU64,
}

impl SnapshotCache {
    pub fn new(db: Arc<Database>, ttl: Duration, default_width: u32, default_height: u32) -> Self {
        Self {
            db,
            ttl,
            default_width,
            default_height,
            inner: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    /// Return the full canvas, rebuilding from the store on miss or expiry.
    pub async fn get_snapshot(&self) -> Result<SnapshotView> {
        {
            let guard = self.inner.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.view.clone());
                }
            }
        }

        let mut guard = self.inner.write().await;
        // Another task may have rebuilt while we waited for the write lock.
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.view.clone());
            }
        }
        let rebuilt = self.rebuild().await?;
        let view = rebuilt.view.clone();
        *guard = Some(rebuilt);
        Ok(view)
    }

    /// Patch a single cell: read the current array (rebuilding if absent or
    /// expired), write index `width * y + x`, store the array back whole.
    pub async fn patch_at(&self, x: i32, y: i32, color_id: i32) -> Result<SnapshotView> {
        let mut guard = self.inner.write().await;

        let current = match guard.take() {
            Some(cached) if cached.expires_at > Instant::now() => cached,
            _ => self.rebuild().await?,
        };

        let view = &current.view;
        if x < 0 || y < 0 || (x as u32) >= view.width || (y as u32) >= view.height {
            // Out-of-range patches (stale after a resize) are dropped; the
            // next rebuild sources the resized grid from the store.
            debug!("Dropping snapshot patch outside bounds: ({}, {})", x, y);
            let view = view.clone();
            *guard = Some(current);
            return Ok(view);
        }

        let mut cells = (*view.cells).clone();
        cells[y as usize * view.width as usize + x as usize] = color_id;
        let patched = SnapshotView {
            version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
            width: view.width,
            height: view.height,
            cells: Arc::new(cells),
        };
        *guard = Some(CachedSnapshot {
            view: patched.clone(),
            expires_at: current.expires_at,
        });
        Ok(patched)
    }

    /// Drop the cached value; the next read rebuilds from the store.
    pub async fn invalidate(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    async fn rebuild(&self) -> Result<CachedSnapshot> {
        let (width, height) = self
            .db
            .canvas_size(self.default_width, self.default_height)
            .await?;
        let cells = self.db.latest_colors(width, height).await?;
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Rebuilt canvas snapshot v{} ({}x{}, ttl {:?})",
            version, width, height, self.ttl
        );
        Ok(CachedSnapshot {
            view: SnapshotView {
                version,
                width,
                height,
                cells: Arc::new(cells),
            },
            expires_at: Instant::now() + self.ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EMPTY_COLOR;
    use chrono::Utc;

    async fn test_db() -> Arc<Database> {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let db = test_db().await;
        db.ensure_user("alice", 2, Utc::now()).await.unwrap();
        db.insert_placement("alice", 2, 2, 3, Utc::now(), None)
            .await
            .unwrap();
        db.insert_placement("alice", 5, 5, 7, Utc::now(), None)
            .await
            .unwrap();

        let first = db.latest_colors(10, 10).await.unwrap();
        let second = db.latest_colors(10, 10).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[2 * 10 + 2], 3);
        assert_eq!(first[5 * 10 + 5], 7);
    }

    #[tokio::test]
    async fn patch_replaces_single_cell() {
        let db = test_db().await;
        db.set_canvas_size(10, 10).await.unwrap();
        let cache = SnapshotCache::new(db, Duration::from_secs(300), 10, 10);

        let before = cache.get_snapshot().await.unwrap();
        assert!(before.cells.iter().all(|c| *c == EMPTY_COLOR));

        let after = cache.patch_at(2, 2, 3).await.unwrap();
        assert_eq!(after.cells[2 * 10 + 2], 3);
        assert_eq!(
            after.cells.iter().filter(|c| **c == EMPTY_COLOR).count(),
            99
        );
        assert!(after.version > before.version);
        // The pre-patch view is untouched (whole-array replace).
        assert_eq!(before.cells[2 * 10 + 2], EMPTY_COLOR);
    }

    #[tokio::test]
    async fn expired_snapshot_rebuilds_from_store() {
        let db = test_db().await;
        db.set_canvas_size(4, 4).await.unwrap();
        let cache = SnapshotCache::new(db.clone(), Duration::from_millis(10), 4, 4);

        let stale = cache.get_snapshot().await.unwrap();
        db.ensure_user("bob", 2, Utc::now()).await.unwrap();
        db.insert_placement("bob", 1, 1, 5, Utc::now(), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = cache.get_snapshot().await.unwrap();
        assert_eq!(stale.cells[1 * 4 + 1], EMPTY_COLOR);
        assert_eq!(fresh.cells[1 * 4 + 1], 5);
    }
}
