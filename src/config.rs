//! Runtime configuration for the canvas engine
//!
//! Two layers: `CanvasConfig` carries the environment-level tunables
//! (dimensions, cooldown, stack depth, cache TTL, worker pool size), and
//! `RuntimeConfig` carries the live palette plus current canvas dimensions.
//! The runtime layer is versioned and swapped whole on reload so in-flight
//! readers never observe a half-updated palette.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CanvasError, Result};

/// Environment-level tunables; all runtime-configurable, none hard-coded.
#[derive(Debug, Clone)]
pub struct CanvasConfig {
    pub default_width: u32,
    pub default_height: u32,
    pub base_cooldown_secs: u64,
    pub max_stack: u32,
    pub snapshot_ttl_secs: u64,
    pub worker_count: usize,
    pub section_edge: u32,
    pub heartbeat_secs: u64,
    pub undo_window_secs: u64,
    pub heatmap_interval_secs: u64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            default_width: 1000,
            default_height: 1000,
            base_cooldown_secs: 60,
            max_stack: 6,
            snapshot_ttl_secs: 300,
            worker_count: 4,
            section_edge: 100,
            heartbeat_secs: 5,
            undo_window_secs: 5,
            heatmap_interval_secs: 600,
        }
    }
}

/// One palette entry; every accepted placement's color id must resolve here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteColor {
    pub id: i32,
    pub hex: String,
    pub name: String,
}

/// Color id written for cells no placement (or an undo back to nothing)
/// covers.
pub const EMPTY_COLOR: i32 = -1;

static DEFAULT_PALETTE: Lazy<Vec<PaletteColor>> = Lazy::new(|| {
    [
        ("#FFFFFF", "white"),
        ("#E4E4E4", "light grey"),
        ("#888888", "grey"),
        ("#222222", "black"),
        ("#FFA7D1", "pink"),
        ("#E50000", "red"),
        ("#E59500", "orange"),
        ("#A06A42", "brown"),
        ("#E5D900", "yellow"),
        ("#94E044", "lime"),
        ("#02BE01", "green"),
        ("#00D3DD", "cyan"),
        ("#0083C7", "blue"),
        ("#0000EA", "dark blue"),
        ("#CF6EE4", "magenta"),
        ("#820080", "purple"),
    ]
    .iter()
    .enumerate()
    .map(|(id, (hex, name))| PaletteColor {
        id: id as i32,
        hex: (*hex).to_string(),
        name: (*name).to_string(),
    })
    .collect()
});

/// Parse a palette from its JSON representation (the CANVAS_PALETTE env var).
pub fn parse_palette(json: &str) -> Result<Vec<PaletteColor>> {
    let palette: Vec<PaletteColor> = serde_json::from_str(json)?;
    if palette.is_empty() {
        return Err(CanvasError::Config("palette must not be empty".into()));
    }
    Ok(palette)
}

pub fn default_palette() -> Vec<PaletteColor> {
    DEFAULT_PALETTE.clone()
}

/// Live configuration consumed by every component: palette, canvas
/// dimensions, frozen flag. Immutable once published; reloads replace the
/// whole object.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub palette: Vec<PaletteColor>,
    pub width: u32,
    pub height: u32,
    pub frozen: bool,
    pub revision: u64,
}

impl RuntimeConfig {
    pub fn color(&self, id: i32) -> Option<&PaletteColor> {
        self.palette.iter().find(|c| c.id == id)
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Row-major rendering of a color-id array into color-or-empty strings
    /// for the wire (`""` for empty cells).
    pub fn render_cells(&self, cells: &[i32]) -> Vec<String> {
        cells
            .iter()
            .map(|id| match self.color(*id) {
                Some(color) => color.hex.clone(),
                None => String::new(),
            })
            .collect()
    }
}

/// Shared handle to the current [`RuntimeConfig`]; readers clone the Arc,
/// reloads replace it whole.
pub struct SharedRuntime {
    inner: RwLock<Arc<RuntimeConfig>>,
}

impl SharedRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub async fn current(&self) -> Arc<RuntimeConfig> {
        self.inner.read().await.clone()
    }

    /// Publish a new runtime configuration, bumping the revision.
    pub async fn replace(&self, mut config: RuntimeConfig) -> Arc<RuntimeConfig> {
        let mut guard = self.inner.write().await;
        config.revision = guard.revision + 1;
        let next = Arc::new(config);
        *guard = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_palette_resolves_ids() {
        let palette = default_palette();
        assert_eq!(palette.len(), 16);
        assert_eq!(palette[3].hex, "#222222");
    }

    #[test]
    fn parse_palette_rejects_empty() {
        assert!(parse_palette("[]").is_err());
        let parsed = parse_palette(r##"[{"id":0,"hex":"#FFFFFF","name":"white"}]"##).unwrap();
        assert_eq!(parsed[0].name, "white");
    }

    #[tokio::test]
    async fn runtime_swap_is_whole_object() {
        let shared = SharedRuntime::new(RuntimeConfig {
            palette: default_palette(),
            width: 10,
            height: 10,
            frozen: false,
            revision: 0,
        });
        let before = shared.current().await;
        shared
            .replace(RuntimeConfig {
                palette: default_palette(),
                width: 20,
                height: 10,
                frozen: false,
                revision: 0,
            })
            .await;
        let after = shared.current().await;
        assert_eq!(before.width, 10);
        assert_eq!(after.width, 20);
        assert_eq!(after.revision, 1);
    }
}
