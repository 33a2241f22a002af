//! Game settlement.
//!
//! Completion and payment are split on purpose: the state machine's
//! `complete` is the once-only gate, and only the caller that gets past it
//! pays. The credit uses a key derived from the room id, so retries and
//! replays after a crash land on the same ledger entry.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;

use super::RoomId;
use crate::game::{GameError, GameOutcome, GameState, Terminal, entities::Amount};
use crate::wallet::{BalanceKind, BalanceService, EntryReason, RetryPolicy, with_retry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub outcome: GameOutcome,
    /// Winner's balance after the credit. `None` if nothing was paid.
    pub new_balance: Option<Amount>,
}

pub struct PayoutTrigger {
    room_id: RoomId,
    balance: Arc<dyn BalanceService>,
    kind: BalanceKind,
    retry: RetryPolicy,
}

impl PayoutTrigger {
    pub fn new(
        room_id: RoomId,
        balance: Arc<dyn BalanceService>,
        kind: BalanceKind,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            room_id,
            balance,
            kind,
            retry,
        }
    }

    /// Ledger key for this room's payout. One per room, ever.
    pub fn idempotency_key(&self) -> String {
        format!("payout_{}", self.room_id)
    }

    /// Complete the game and pay the pool to the winner. A second call for
    /// the same game fails with `AlreadyCompleted` and credits nothing.
    pub async fn settle(
        &self,
        state: &mut GameState,
        terminal: Terminal,
        now: DateTime<Utc>,
    ) -> Result<Settlement, GameError> {
        let outcome = state.complete(terminal, now)?;
        info!(
            "Room {} completed ({}), winner {:?}, pool {}",
            self.room_id, outcome.reason, outcome.winner, outcome.pool_amount
        );

        let Some(winner) = outcome.winner else {
            warn!("Room {} completed without a winner, pool of {} not paid", self.room_id, outcome.pool_amount);
            return Ok(Settlement {
                outcome,
                new_balance: None,
            });
        };
        if outcome.pool_amount <= 0 {
            return Ok(Settlement {
                outcome,
                new_balance: None,
            });
        }

        let key = self.idempotency_key();
        let result = with_retry(&self.retry, "payout", || {
            self.balance.credit(
                winner,
                outcome.pool_amount,
                self.kind,
                EntryReason::Payout,
                &key,
            )
        })
        .await;

        let new_balance = match result {
            Ok(balance) => Some(balance),
            Err(e) => {
                error!(
                    "CRITICAL: Failed to pay {} to user {} for room {} (key {}): {}. Pool is unpaid!",
                    outcome.pool_amount, winner, self.room_id, key, e
                );
                None
            }
        };

        Ok(Settlement {
            outcome,
            new_balance,
        })
    }
}
