//! Inactivity tracking.
//!
//! Every forced play after a turn timeout bumps the player's
//! `auto_play_count`. Once it reaches the room's threshold the player is
//! taken out of the rotation even if they still hold cards.

use chrono::{DateTime, Utc};
use log::info;

use super::entities::{DisableReason, UserId};
use super::state_machine::{GameError, GameState, Terminal};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AutoPlayVerdict {
    Continue,
    Disabled {
        player_id: UserId,
        /// Set when removing the player ended the game.
        terminal: Option<Terminal>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AutoPlayMonitor {
    threshold: u32,
}

impl AutoPlayMonitor {
    /// A threshold of zero is treated as one.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Check a player right after a timeout play.
    pub fn observe(
        &self,
        state: &mut GameState,
        player_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<AutoPlayVerdict, GameError> {
        let player = state.player(player_id).ok_or(GameError::PlayerNotFound)?;
        if !player.is_active || player.auto_play_count < self.threshold {
            return Ok(AutoPlayVerdict::Continue);
        }

        info!(
            "player {} auto-played {} times in a row, removing from rotation",
            player_id, player.auto_play_count
        );
        let terminal = state.deactivate_player(player_id, DisableReason::AutoPlay, now)?;
        Ok(AutoPlayVerdict::Disabled {
            player_id,
            terminal,
        })
    }
}

impl Default for AutoPlayMonitor {
    fn default() -> Self {
        Self::new(2)
    }
}
