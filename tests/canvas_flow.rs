//! End-to-end flows over an in-memory store: admission through the gate,
//! folding into snapshots and sections, undo, and ban inheritance.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use pixelboard::config::{RuntimeConfig, SharedRuntime};
use pixelboard::economy::Economy;
use pixelboard::gate::{AdmissionGate, Outcome, Session, UndoOutcome};
use pixelboard::protocol::RejectReason;
use pixelboard::sections::{SectionGeometry, SectionPool};
use pixelboard::{default_palette, Database, SnapshotCache, EMPTY_COLOR};

struct Harness {
    db: Arc<Database>,
    runtime: Arc<SharedRuntime>,
    gate: AdmissionGate,
    snapshot: SnapshotCache,
    width: u32,
    height: u32,
}

async fn harness(width: u32, height: u32) -> Harness {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    db.ensure_schema().await.unwrap();
    db.set_canvas_size(width, height).await.unwrap();

    let runtime = Arc::new(SharedRuntime::new(RuntimeConfig {
        palette: default_palette(),
        width,
        height,
        frozen: false,
        revision: 0,
    }));
    let gate = AdmissionGate::new(
        db.clone(),
        runtime.clone(),
        Economy::new(Duration::seconds(60), 6),
        Duration::seconds(5),
        6,
    );
    let snapshot = SnapshotCache::new(db.clone(), StdDuration::from_secs(300), width, height);

    Harness {
        db,
        runtime,
        gate,
        snapshot,
        width,
        height,
    }
}

fn session(user: &str) -> Session {
    Session {
        user_id: Some(user.to_string()),
        domain: Some("canvas.example.com".to_string()),
    }
}

#[tokio::test]
async fn placed_pixel_appears_in_rendered_snapshot() {
    let h = harness(10, 10).await;

    let outcome = h.gate.try_place(&session("alice"), 2, 2, 3).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));

    let snapshot = h.snapshot.get_snapshot().await.unwrap();
    let runtime = h.runtime.current().await;
    let cells = runtime.render_cells(&snapshot.cells);

    assert_eq!(cells.len(), 100);
    let hex = runtime.color(3).unwrap().hex.clone();
    for (i, cell) in cells.iter().enumerate() {
        if i == 2 * 10 + 2 {
            assert_eq!(cell, &hex);
        } else {
            assert_eq!(cell, "", "cell {i} should be empty");
        }
    }
}

#[tokio::test]
async fn same_millisecond_placements_resolve_by_insertion_order() {
    let h = harness(4, 4).await;

    // Two placements at one coordinate sharing a timestamp; the fold must
    // pick the later row id every time it runs.
    let at = Utc::now();
    h.db.ensure_user("alice", 6, at).await.unwrap();
    h.db.ensure_user("bob", 6, at).await.unwrap();
    h.db.insert_placement("alice", 1, 1, 2, at, None)
        .await
        .unwrap();
    h.db.insert_placement("bob", 1, 1, 7, at, None)
        .await
        .unwrap();

    for _ in 0..3 {
        let cells = h.db.latest_colors(h.width, h.height).await.unwrap();
        assert_eq!(cells[1 * 4 + 1], 7);
    }
}

#[tokio::test]
async fn undo_restores_prior_color_everywhere() {
    let h = harness(8, 8).await;
    let alice = session("alice");
    let bob = session("bob");

    let first = h.gate.try_place(&bob, 3, 3, 5).await.unwrap();
    assert!(matches!(first, Outcome::Accepted(_)));
    let second = h.gate.try_place(&alice, 3, 3, 9).await.unwrap();
    assert!(matches!(second, Outcome::Accepted(_)));

    let undo = h.gate.try_undo(&alice).await.unwrap();
    let restored = match undo {
        UndoOutcome::Accepted(restored) => restored,
        UndoOutcome::Rejected => panic!("undo inside the window must be accepted"),
    };
    assert_eq!(restored.tombstone.color_id, 5);

    // The fold, the snapshot and the section grid all agree on bob's color.
    let cells = h.db.latest_colors(h.width, h.height).await.unwrap();
    assert_eq!(cells[3 * 8 + 3], 5);

    h.snapshot.invalidate().await;
    let snapshot = h.snapshot.get_snapshot().await.unwrap();
    assert_eq!(snapshot.cells[3 * 8 + 3], 5);

    let sections = SectionPool::new(
        h.db.clone(),
        SectionGeometry::new(h.width, h.height, 4),
        2,
        StdDuration::from_secs(300),
    );
    let assembled = sections.assemble_full().await.unwrap();
    assert_eq!(assembled[3 * 8 + 3], 5);
}

#[tokio::test]
async fn section_grid_matches_snapshot_after_gate_traffic() {
    let h = harness(10, 10).await;

    // Scatter placements across all four sections of a 5-cell edge grid.
    for (i, (x, y)) in [(0, 0), (9, 0), (0, 9), (9, 9), (4, 4), (5, 5)]
        .iter()
        .enumerate()
    {
        let user = format!("user{i}");
        let outcome = h
            .gate
            .try_place(&session(&user), *x, *y, (i % 16) as i32)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));
    }

    let sections = SectionPool::new(
        h.db.clone(),
        SectionGeometry::new(h.width, h.height, 5),
        3,
        StdDuration::from_secs(300),
    );
    let assembled = sections.assemble_full().await.unwrap();
    let folded = h.db.latest_colors(h.width, h.height).await.unwrap();
    assert_eq!(assembled, folded);

    // Rebuilding is idempotent: a second assembly changes nothing.
    assert_eq!(sections.assemble_full().await.unwrap(), folded);

    let snapshot = h.snapshot.get_snapshot().await.unwrap();
    assert_eq!(*snapshot.cells, folded);
}

#[tokio::test]
async fn domain_bans_inherit_to_subdomains() {
    let h = harness(8, 8).await;
    h.db.upsert_ban("domain:aftermath.gg", true, None, Some("raid".into()))
        .await
        .unwrap();

    let banned = Session {
        user_id: Some("alice".into()),
        domain: Some("chat.aftermath.gg".into()),
    };
    let outcome = h.gate.try_place(&banned, 1, 1, 2).await.unwrap();
    assert!(matches!(outcome, Outcome::Rejected(RejectReason::Banned)));

    // An explicit unban row on the subdomain overrides the parent ban.
    h.db.upsert_ban("domain:chat.aftermath.gg", false, None, None)
        .await
        .unwrap();
    let outcome = h.gate.try_place(&banned, 1, 1, 2).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));

    // The parent domain itself stays banned.
    let parent = Session {
        user_id: Some("bob".into()),
        domain: Some("aftermath.gg".into()),
    };
    let outcome = h.gate.try_place(&parent, 2, 2, 2).await.unwrap();
    assert!(matches!(outcome, Outcome::Rejected(RejectReason::Banned)));
}

#[tokio::test]
async fn stack_exhaustion_rejects_with_cooldown() {
    let h = harness(8, 8).await;
    let alice = session("alice");

    for i in 0..6 {
        let outcome = h.gate.try_place(&alice, i, 0, 1).await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)), "placement {i}");
    }
    let outcome = h.gate.try_place(&alice, 6, 0, 1).await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Rejected(RejectReason::OnCooldown)
    ));

    let (available, next_refill_at) = h.gate.availability("alice").await.unwrap();
    assert_eq!(available, 0);
    assert!(next_refill_at.is_some());
}

#[tokio::test]
async fn resize_rebuilds_snapshot_at_new_dimensions() {
    let h = harness(6, 6).await;
    let outcome = h.gate.try_place(&session("alice"), 5, 5, 4).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));
    assert_eq!(h.snapshot.get_snapshot().await.unwrap().cells.len(), 36);

    h.db.set_canvas_size(12, 6).await.unwrap();
    h.snapshot.invalidate().await;

    let snapshot = h.snapshot.get_snapshot().await.unwrap();
    assert_eq!(snapshot.cells.len(), 72);
    assert_eq!(snapshot.cells[5 * 12 + 5], 4);
    assert_eq!(snapshot.cells[5 * 12 + 11], EMPTY_COLOR);
}
