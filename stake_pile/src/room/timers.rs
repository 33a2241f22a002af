//! Per-room timers.
//!
//! A room has at most one pending timer of each [`TimerKind`]. Arming a kind
//! replaces whatever was pending for it, so a stale deadline can never fire
//! after the state moved on. The room actor sleeps until
//! [`TimerCoordinator::next_deadline`] and then pops every due kind.
//!
//! Deadlines owned by the game state are followed with
//! [`TimerCoordinator::sync`], which never re-arms a deadline that already
//! fired. A handler that leaves its deadline untouched therefore can't spin.

use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::BTreeMap, time::Duration};
use tokio::time::Instant;

/// Ordering doubles as firing order when several kinds are due at once.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TimerKind {
    /// Waiting-room countdown, or the grace delay once the room is ready.
    Waiting,
    /// The whole game's clock.
    Round,
    Turn,
    MatchSettle,
    Ballot,
    /// Teardown after completion.
    Cleanup,
}

#[derive(Clone, Copy, Debug)]
struct Timer {
    at: Instant,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TimerCoordinator {
    timers: BTreeMap<TimerKind, Timer>,
    /// Last deadline that fired per kind.
    fired: BTreeMap<TimerKind, DateTime<Utc>>,
}

impl TimerCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at the wall-clock `deadline`. Returns false if it
    /// was already armed for that exact deadline.
    pub fn arm(&mut self, kind: TimerKind, deadline: DateTime<Utc>) -> bool {
        if self.deadline(kind) == Some(deadline) {
            return false;
        }
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.timers.insert(
            kind,
            Timer {
                at: Instant::now() + delay,
                deadline,
            },
        );
        true
    }

    /// Arm `kind` to fire after `delay`. Returns the wall-clock deadline.
    pub fn arm_after(&mut self, kind: TimerKind, delay: Duration) -> DateTime<Utc> {
        let deadline = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
        self.timers.insert(
            kind,
            Timer {
                at: Instant::now() + delay,
                deadline,
            },
        );
        deadline
    }

    /// Make `kind` follow a deadline owned by someone else: arm when set,
    /// cancel when cleared, leave alone when unchanged or already fired.
    pub fn sync(&mut self, kind: TimerKind, deadline: Option<DateTime<Utc>>) {
        match deadline {
            Some(deadline) if self.fired.get(&kind) == Some(&deadline) => {}
            Some(deadline) => {
                self.arm(kind, deadline);
            }
            None => {
                self.cancel(kind);
            }
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.timers.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        self.timers.get(&kind).map(|t| t.deadline)
    }

    /// Earliest pending instant, if anything is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.at).min()
    }

    /// Remove and return every kind due at `now`, in firing order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let due: Vec<TimerKind> = self
            .timers
            .iter()
            .filter(|(_, t)| t.at <= now)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in &due {
            if let Some(timer) = self.timers.remove(kind) {
                self.fired.insert(*kind, timer.deadline);
            }
        }
        due
    }
}
