//! Cooldown/stacking economy state machine
//!
//! A user banks up to `max_stack` pixels. Accrual is counted from one
//! shared anchor time rather than per-pixel timers, keeping the state O(1)
//! per user regardless of stack depth. The refill cost of the Nth banked
//! pixel is a pluggable, monotonically non-decreasing function of N; the
//! default is linear (N x base cooldown).
//!
//! Everything here is pure: callers pass `now`, no I/O, no global clock.

use chrono::{DateTime, Duration, Utc};

/// Refill cost of the Nth banked pixel. Never evaluated at n == 0.
pub type CostFn = fn(n: u32, base: Duration) -> Duration;

/// Reference cost function: cost(N) = N x base cooldown.
pub fn linear_cost(n: u32, base: Duration) -> Duration {
    base * n as i32
}

/// Flat cost function: every banked pixel costs one base cooldown.
pub fn flat_cost(_n: u32, base: Duration) -> Duration {
    base
}

/// The persisted slice of a user's economy row this module operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EconomyState {
    pub pixel_stack: u32,
    pub stack_anchor_time: DateTime<Utc>,
}

/// An [`EconomyState`] brought forward to a specific `now`, with the
/// derived next-refill timestamp (None when the stack is full).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub state: EconomyState,
    pub next_refill_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Economy {
    base_cooldown: Duration,
    max_stack: u32,
    cost: CostFn,
}

impl Economy {
    pub fn new(base_cooldown: Duration, max_stack: u32) -> Self {
        Self::with_cost_fn(base_cooldown, max_stack, linear_cost)
    }

    pub fn with_cost_fn(base_cooldown: Duration, max_stack: u32, cost: CostFn) -> Self {
        Self {
            base_cooldown,
            max_stack,
            cost,
        }
    }

    pub fn max_stack(&self) -> u32 {
        self.max_stack
    }

    pub fn base_cooldown(&self) -> Duration {
        self.base_cooldown
    }

    fn cost_of(&self, n: u32) -> Duration {
        debug_assert!(n >= 1, "cost function evaluated at n <= 0");
        (self.cost)(n, self.base_cooldown)
    }

    /// Replay refills accrued since the anchor, capped at `max_stack`.
    ///
    /// While the stack is full no progress accrues, so the anchor is
    /// clamped forward to `now` (a monotone adjustment); otherwise a user
    /// idling at a full stack would bank invisible refills and regenerate
    /// spent pixels instantly.
    pub fn settle(&self, state: EconomyState, now: DateTime<Utc>) -> Settled {
        let mut stack = state.pixel_stack.min(self.max_stack);
        let mut anchor = state.stack_anchor_time;

        while stack < self.max_stack {
            let cost = self.cost_of(stack + 1);
            if now >= anchor + cost {
                stack += 1;
                anchor += cost;
            } else {
                break;
            }
        }

        if stack == self.max_stack && now > anchor {
            anchor = now;
        }

        let next_refill_at = if stack >= self.max_stack {
            None
        } else {
            Some(anchor + self.cost_of(stack + 1))
        };

        Settled {
            state: EconomyState {
                pixel_stack: stack,
                stack_anchor_time: anchor,
            },
            next_refill_at,
        }
    }

    /// Spend one banked pixel from a settled state. Returns None when no
    /// pixel is available. The anchor is left in place, so partial elapsed
    /// progress toward the next refill is kept; only the refill target
    /// shrinks with the smaller stack size.
    pub fn spend(&self, settled: &Settled) -> Option<EconomyState> {
        if settled.state.pixel_stack == 0 {
            return None;
        }
        Some(EconomyState {
            pixel_stack: settled.state.pixel_stack - 1,
            stack_anchor_time: settled.state.stack_anchor_time,
        })
    }

    /// Exact inverse of [`spend`](Self::spend), used by undo refunds: the
    /// pixel comes back and the anchor stays put, so no refill progress is
    /// gained or lost by the round trip.
    pub fn refund(&self, state: EconomyState) -> EconomyState {
        EconomyState {
            pixel_stack: (state.pixel_stack + 1).min(self.max_stack),
            stack_anchor_time: state.stack_anchor_time,
        }
    }

    /// External grant (admin top-up): the anchor advances
    /// forward by the sum of refill costs of the newly granted slots, so
    /// future elapsed-time refills remain consistent with the new stack.
    pub fn grant(&self, state: EconomyState, delta: u32) -> EconomyState {
        let mut stack = state.pixel_stack.min(self.max_stack);
        let mut anchor = state.stack_anchor_time;
        for _ in 0..delta {
            if stack >= self.max_stack {
                break;
            }
            stack += 1;
            anchor += self.cost_of(stack);
        }
        EconomyState {
            pixel_stack: stack,
            stack_anchor_time: anchor,
        }
    }
}
