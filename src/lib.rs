//! Collaborative pixel canvas service
//!
//! This crate provides:
//! - Admission gate with a per-user cooldown/stacking economy
//! - Append-only placement store with last-write-wins folding
//! - TTL snapshot cache and sharded section workers
//! - Websocket fan-out with a cross-shard presence registry
//! - Token-guarded admin HTTP surface and batch-job triggers
//!
//! Can be used as a library or standalone binary

pub mod cache;
pub mod config;
pub mod database;
pub mod economy;
pub mod entity;
pub mod error;
pub mod fanout;
pub mod gate;
pub mod jobs;
pub mod protocol;
pub mod sections;
pub mod server;

// Re-export commonly used types
pub use cache::{SnapshotCache, SnapshotView};
pub use config::{
    default_palette, parse_palette, CanvasConfig, PaletteColor, RuntimeConfig, SharedRuntime,
    EMPTY_COLOR,
};
pub use database::Database;
pub use economy::{Economy, EconomyState};
pub use error::{CanvasError, Result};
pub use fanout::ConnectionHub;
pub use gate::{AdmissionGate, Outcome, Session, UndoOutcome};
pub use jobs::{BatchJobs, JobScheduler};
pub use protocol::{ClientMsg, RejectReason, ServerMsg};
pub use sections::{SectionGeometry, SectionPool};
pub use server::{ServiceConfig, ServiceRunner};
