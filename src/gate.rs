//! Admission gate
//!
//! The single synchronization point for placements: every pixel written to
//! the store passes the ordered check sequence here, and nothing else ever
//! writes to the placement log. Rejections are side-effect free; an accept
//! synchronously persists the placement and decrements the user's bank via
//! a compare-and-swap economy write, so two shards racing the same user
//! cannot both spend the last banked pixel.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::SharedRuntime;
use crate::database::Database;
use crate::economy::{Economy, EconomyState};
use crate::entity::{placements, users};
use crate::error::{CanvasError, Result};
use crate::protocol::RejectReason;

const MAX_CAS_RETRIES: u32 = 3;

/// Transport-level identity bound to a connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user_id: Option<String>,
    pub domain: Option<String>,
}

/// An accepted placement plus the economy numbers fan-out pushes back to
/// the placing user.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub placement: placements::Model,
    pub available: u32,
    pub next_refill_at: Option<DateTime<Utc>>,
    pub undo_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Accepted(Box<Accepted>),
    Rejected(RejectReason),
}

/// An accepted undo: the tombstone row plus the reverted placement.
#[derive(Debug, Clone)]
pub struct UndoAccepted {
    pub tombstone: placements::Model,
    pub reverted: placements::Model,
    pub available: u32,
    pub next_refill_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum UndoOutcome {
    Accepted(Box<UndoAccepted>),
    Rejected,
}

/// A user's current ban standing, pushed on connect.
#[derive(Debug, Clone, Default)]
pub struct Standing {
    pub banned: bool,
    pub until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

pub struct AdmissionGate {
    db: Arc<Database>,
    runtime: Arc<SharedRuntime>,
    economy: Economy,
    undo_window: Duration,
    initial_stack: u32,
}

impl AdmissionGate {
    pub fn new(
        db: Arc<Database>,
        runtime: Arc<SharedRuntime>,
        economy: Economy,
        undo_window: Duration,
        initial_stack: u32,
    ) -> Self {
        Self {
            db,
            runtime,
            economy,
            undo_window,
            initial_stack,
        }
    }

    pub fn economy(&self) -> &Economy {
        &self.economy
    }

    /// Ordered, short-circuiting admission checks; the only write path
    /// into the placement log.
    pub async fn try_place(
        &self,
        session: &Session,
        x: i32,
        y: i32,
        color_id: i32,
    ) -> Result<Outcome> {
        let Some(user_id) = session.user_id.as_deref() else {
            return Ok(Outcome::Rejected(RejectReason::NoUser));
        };
        let now = Utc::now();

        // Economy rows are created on first authentication.
        let user = self.db.ensure_user(user_id, self.initial_stack, now).await?;

        if self.standing_of(&user, session.domain.as_deref(), now).await?.banned {
            return Ok(Outcome::Rejected(RejectReason::Banned));
        }

        let config = self.runtime.current().await;
        if !config.in_bounds(x, y) {
            return Ok(Outcome::Rejected(RejectReason::OutOfBounds));
        }
        if config.color(color_id).is_none() {
            return Ok(Outcome::Rejected(RejectReason::InvalidColor));
        }
        if config.frozen {
            return Ok(Outcome::Rejected(RejectReason::Frozen));
        }

        // Read-decide-CAS loop over the economy row; a lost swap means
        // another shard spent for this user first, so re-read and retry.
        let mut user = user;
        for attempt in 1..=MAX_CAS_RETRIES {
            let settled = self.economy.settle(economy_state(&user), now);
            let Some(spent) = self.economy.spend(&settled) else {
                debug!(
                    "Placement by {} rejected on cooldown (next refill {:?})",
                    user_id, settled.next_refill_at
                );
                return Ok(Outcome::Rejected(RejectReason::OnCooldown));
            };

            let undo_expires_at = now + self.undo_window;
            let placement = self
                .db
                .place_with_economy_cas(
                    user_id,
                    spent.pixel_stack as i32,
                    spent.stack_anchor_time,
                    Some(undo_expires_at),
                    user.version,
                    x,
                    y,
                    color_id,
                    now,
                    None,
                )
                .await?;

            if let Some(placement) = placement {
                let resettled = self.economy.settle(spent, now);
                return Ok(Outcome::Accepted(Box::new(Accepted {
                    placement,
                    available: resettled.state.pixel_stack,
                    next_refill_at: resettled.next_refill_at,
                    undo_expires_at,
                })));
            }

            debug!(
                "Economy CAS conflict for {} (attempt {}/{})",
                user_id, attempt, MAX_CAS_RETRIES
            );
            tokio::time::sleep(StdDuration::from_millis(fastrand::u64(1..25))).await;
            user = self
                .db
                .load_user(user_id)
                .await?
                .ok_or_else(|| CanvasError::EconomyConflict(format!("user {user_id} vanished")))?;
        }

        Err(CanvasError::EconomyConflict(format!(
            "economy write for {user_id} lost {MAX_CAS_RETRIES} swaps"
        )))
    }

    /// Undo the user's most recent placement inside the undo window:
    /// appends a tombstone carrying the color beneath and refunds the
    /// banked pixel.
    pub async fn try_undo(&self, session: &Session) -> Result<UndoOutcome> {
        let Some(user_id) = session.user_id.as_deref() else {
            return Ok(UndoOutcome::Rejected);
        };
        let now = Utc::now();

        let Some(mut user) = self.db.load_user(user_id).await? else {
            return Ok(UndoOutcome::Rejected);
        };
        if user.undo_expires_at.map_or(true, |t| t <= now) {
            return Ok(UndoOutcome::Rejected);
        }
        let Some(reverted) = self.db.last_undoable_placement(user_id).await? else {
            return Ok(UndoOutcome::Rejected);
        };
        let beneath = self.db.color_beneath(&reverted).await?;

        for _attempt in 1..=MAX_CAS_RETRIES {
            let settled = self.economy.settle(economy_state(&user), now);
            let refunded = self.economy.refund(settled.state);
            let tombstone = self
                .db
                .place_with_economy_cas(
                    user_id,
                    refunded.pixel_stack as i32,
                    refunded.stack_anchor_time,
                    None,
                    user.version,
                    reverted.x,
                    reverted.y,
                    beneath,
                    now,
                    Some(reverted.id),
                )
                .await?;
            if let Some(tombstone) = tombstone {
                let resettled = self.economy.settle(refunded, now);
                return Ok(UndoOutcome::Accepted(Box::new(UndoAccepted {
                    tombstone,
                    reverted,
                    available: resettled.state.pixel_stack,
                    next_refill_at: resettled.next_refill_at,
                })));
            }
            tokio::time::sleep(StdDuration::from_millis(fastrand::u64(1..25))).await;
            match self.db.load_user(user_id).await? {
                Some(fresh) => user = fresh,
                None => return Ok(UndoOutcome::Rejected),
            }
        }

        Err(CanvasError::EconomyConflict(format!(
            "undo refund for {user_id} lost {MAX_CAS_RETRIES} swaps"
        )))
    }

    /// Admin stack grant: modifyStack with delta > 0. Returns the settled
    /// stack count and next refill for fan-out.
    pub async fn grant_stack(
        &self,
        user_id: &str,
        delta: u32,
    ) -> Result<(u32, Option<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut user = self.db.ensure_user(user_id, self.initial_stack, now).await?;
        for _attempt in 1..=MAX_CAS_RETRIES {
            let settled = self.economy.settle(economy_state(&user), now);
            let granted = self.economy.grant(settled.state, delta);
            let won = self
                .db
                .update_user_economy_cas(
                    user_id,
                    granted.pixel_stack as i32,
                    granted.stack_anchor_time,
                    user.undo_expires_at,
                    user.version,
                )
                .await?;
            if won {
                let resettled = self.economy.settle(granted, now);
                return Ok((resettled.state.pixel_stack, resettled.next_refill_at));
            }
            tokio::time::sleep(StdDuration::from_millis(fastrand::u64(1..25))).await;
            user = self
                .db
                .load_user(user_id)
                .await?
                .ok_or_else(|| CanvasError::EconomyConflict(format!("user {user_id} vanished")))?;
        }
        Err(CanvasError::EconomyConflict(format!(
            "stack grant for {user_id} lost {MAX_CAS_RETRIES} swaps"
        )))
    }

    /// Current availability for one user without spending anything.
    pub async fn availability(&self, user_id: &str) -> Result<(u32, Option<DateTime<Utc>>)> {
        let now = Utc::now();
        let user = self.db.ensure_user(user_id, self.initial_stack, now).await?;
        let settled = self.economy.settle(economy_state(&user), now);
        Ok((settled.state.pixel_stack, settled.next_refill_at))
    }

    /// Ban standing for the connect-time `standing` push and the admission
    /// check: per-user field, then the ban table, then the domain walk.
    pub async fn standing(&self, session: &Session) -> Result<Standing> {
        let now = Utc::now();
        let user = match session.user_id.as_deref() {
            Some(user_id) => match self.db.load_user(user_id).await? {
                Some(user) => Some(user),
                None => None,
            },
            None => None,
        };
        match user {
            Some(user) => self.standing_of(&user, session.domain.as_deref(), now).await,
            None => match session.domain.as_deref() {
                Some(domain) => match self.db.effective_domain_ban(domain, now).await? {
                    Some(ban) => Ok(Standing {
                        banned: true,
                        until: ban.expires_at,
                        reason: ban.reason,
                    }),
                    None => Ok(Standing::default()),
                },
                None => Ok(Standing::default()),
            },
        }
    }

    async fn standing_of(
        &self,
        user: &users::Model,
        domain: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Standing> {
        if let Some(until) = user.ban_until {
            if until > now {
                return Ok(Standing {
                    banned: true,
                    until: Some(until),
                    reason: None,
                });
            }
        }
        if let Some(ban) = self.db.user_ban(&user.user_id, now).await? {
            return Ok(Standing {
                banned: true,
                until: ban.expires_at,
                reason: ban.reason,
            });
        }
        if let Some(domain) = domain {
            if let Some(ban) = self.db.effective_domain_ban(domain, now).await? {
                return Ok(Standing {
                    banned: true,
                    until: ban.expires_at,
                    reason: ban.reason,
                });
            }
        }
        Ok(Standing::default())
    }
}

fn economy_state(user: &users::Model) -> EconomyState {
    EconomyState {
        pixel_stack: user.pixel_stack.max(0) as u32,
        stack_anchor_time: user.stack_anchor_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_palette, RuntimeConfig};

    async fn fixture(frozen: bool) -> (Arc<Database>, AdmissionGate) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        db.ensure_schema().await.unwrap();
        db.set_canvas_size(10, 10).await.unwrap();
        let runtime = Arc::new(SharedRuntime::new(RuntimeConfig {
            palette: default_palette(),
            width: 10,
            height: 10,
            frozen,
            revision: 0,
        }));
        let gate = AdmissionGate::new(
            db.clone(),
            runtime,
            Economy::new(Duration::seconds(60), 6),
            Duration::seconds(5),
            1,
        );
        (db, gate)
    }

    fn session(user: &str) -> Session {
        Session {
            user_id: Some(user.to_string()),
            domain: None,
        }
    }

    #[tokio::test]
    async fn rejects_without_session_user() {
        let (_db, gate) = fixture(false).await;
        let outcome = gate.try_place(&Session::default(), 1, 1, 0).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(RejectReason::NoUser)));
    }

    #[tokio::test]
    async fn rejects_out_of_bounds_before_economy() {
        let (_db, gate) = fixture(false).await;
        let outcome = gate.try_place(&session("a"), 10, 0, 0).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::OutOfBounds)
        ));
        let outcome = gate.try_place(&session("a"), -1, 0, 0).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::OutOfBounds)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_palette_color() {
        let (_db, gate) = fixture(false).await;
        let outcome = gate.try_place(&session("a"), 1, 1, 99).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::InvalidColor)
        ));
    }

    #[tokio::test]
    async fn rejects_banned_user_with_future_expiry() {
        let (db, gate) = fixture(false).await;
        db.ensure_user("b", 1, Utc::now()).await.unwrap();
        db.set_user_ban("b", Some(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let outcome = gate.try_place(&session("b"), 1, 1, 0).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(RejectReason::Banned)));

        // An expired ban no longer blocks.
        db.set_user_ban("b", Some(Utc::now() - Duration::hours(1)))
            .await
            .unwrap();
        let outcome = gate.try_place(&session("b"), 1, 1, 0).await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));
    }

    #[tokio::test]
    async fn frozen_canvas_rejects_placement() {
        let (_db, gate) = fixture(true).await;
        let outcome = gate.try_place(&session("c"), 1, 1, 0).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(RejectReason::Frozen)));
    }

    #[tokio::test]
    async fn accept_spends_and_persists() {
        let (db, gate) = fixture(false).await;
        let outcome = gate.try_place(&session("d"), 2, 2, 3).await.unwrap();
        let accepted = match outcome {
            Outcome::Accepted(a) => a,
            other => panic!("expected accept, got {other:?}"),
        };
        assert_eq!(accepted.available, 0);
        assert_eq!(accepted.placement.color_id, 3);

        let user = db.load_user("d").await.unwrap().unwrap();
        assert_eq!(user.pixel_stack, 0);
        assert_eq!(user.version, 1);

        // Bank empty now: immediately placing again is on cooldown.
        let outcome = gate.try_place(&session("d"), 3, 3, 3).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::OnCooldown)
        ));
    }

    #[tokio::test]
    async fn cooldown_boundary_respects_anchor_time() {
        let (db, gate) = fixture(false).await;
        let now = Utc::now();
        let user = db.ensure_user("e", 1, now).await.unwrap();

        // Drain the initial pixel, then pin the anchor one second short of
        // a full base cooldown in the past: still on cooldown.
        assert!(db
            .update_user_economy_cas("e", 0, now - Duration::seconds(59), None, user.version)
            .await
            .unwrap());
        let outcome = gate.try_place(&session("e"), 1, 1, 0).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::OnCooldown)
        ));

        // Anchor a full cooldown back: accepted, stack spent back to zero,
        // anchor advanced by exactly the base cooldown.
        let user = db.load_user("e").await.unwrap().unwrap();
        let anchor = Utc::now() - Duration::seconds(61);
        assert!(db
            .update_user_economy_cas("e", 0, anchor, None, user.version)
            .await
            .unwrap());
        let outcome = gate.try_place(&session("e"), 1, 1, 0).await.unwrap();
        let accepted = match outcome {
            Outcome::Accepted(a) => a,
            other => panic!("expected accept, got {other:?}"),
        };
        assert_eq!(accepted.available, 0);
        let user = db.load_user("e").await.unwrap().unwrap();
        assert_eq!(user.stack_anchor_time, anchor + Duration::seconds(60));
    }

    #[tokio::test]
    async fn undo_refunds_and_restores_prior_color() {
        let (db, gate) = fixture(false).await;

        // First user paints the cell, second user paints over it.
        match gate.try_place(&session("f1"), 4, 4, 2).await.unwrap() {
            Outcome::Accepted(_) => {}
            other => panic!("expected accept, got {other:?}"),
        }
        match gate.try_place(&session("f2"), 4, 4, 5).await.unwrap() {
            Outcome::Accepted(_) => {}
            other => panic!("expected accept, got {other:?}"),
        }

        let undone = match gate.try_undo(&session("f2")).await.unwrap() {
            UndoOutcome::Accepted(u) => u,
            UndoOutcome::Rejected => panic!("undo rejected"),
        };
        assert_eq!(undone.tombstone.color_id, 2);
        assert_eq!(undone.tombstone.undo_of, Some(undone.reverted.id));
        assert_eq!(undone.available, 1);

        // The cell folds back to the first user's color.
        let cells = db.latest_colors(10, 10).await.unwrap();
        assert_eq!(cells[4 * 10 + 4], 2);

        // The window is consumed: a second undo is rejected.
        assert!(matches!(
            gate.try_undo(&session("f2")).await.unwrap(),
            UndoOutcome::Rejected
        ));
    }

    #[tokio::test]
    async fn accepts_after_external_version_bump() {
        let (db, gate) = fixture(false).await;
        db.ensure_user("g", 1, Utc::now()).await.unwrap();

        // Another writer bumps the version first; the gate reads the fresh
        // row and its swap still lands against the new version.
        assert!(db
            .update_user_economy_cas("g", 1, Utc::now(), None, 0)
            .await
            .unwrap());
        let outcome = gate.try_place(&session("g"), 0, 0, 1).await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));
    }

    #[tokio::test]
    async fn lost_economy_swap_appends_no_placement() {
        let (db, _gate) = fixture(false).await;
        let now = Utc::now();
        let user = db.ensure_user("h", 1, now).await.unwrap();

        // A stale expected version must leave both the economy row and
        // the placement log untouched; the spend and the append commit
        // together or not at all.
        let result = db
            .place_with_economy_cas("h", 0, now, None, user.version + 7, 1, 1, 2, now, None)
            .await
            .unwrap();
        assert!(result.is_none());

        let cells = db.latest_colors(10, 10).await.unwrap();
        assert!(cells.iter().all(|c| *c == crate::config::EMPTY_COLOR));
        let fresh = db.load_user("h").await.unwrap().unwrap();
        assert_eq!(fresh.version, user.version);
        assert_eq!(fresh.pixel_stack, 1);
    }
}
