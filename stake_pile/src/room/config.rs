//! Room configuration models.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::game::{
    GameSettings, ReplenishPolicy,
    constants::{MAX_CAPACITY, MIN_PLAYERS},
    entities::Amount,
};
use crate::wallet::BalanceKind;

/// Whether a room shows up in public listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    /// Joinable by code only.
    Private,
}

impl Visibility {
    pub fn parse(s: &str) -> Self {
        match s {
            "private" => Visibility::Private,
            _ => Visibility::Public,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// Room configuration. Fixed at creation.
///
/// Durations are whole seconds unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomConfig {
    pub visibility: Visibility,

    /// Seats, 2..=8. Filling every seat makes the room ready.
    pub capacity: usize,

    /// Debited from each player on join and per approved replenishment.
    pub stake_amount: Amount,

    pub turn_duration: u64,

    /// Length of a whole game before it ends on time.
    pub round_duration: u64,

    /// Free shuffles per player between replenishments.
    pub shuffle_limit: u32,

    /// Delay between a full room and the automatic start.
    pub ready_grace: u64,

    /// How long an unfilled room waits before starting or dissolving.
    pub waiting_timeout: u64,

    pub match_settle_ms: u64,

    pub vote_window: u64,

    /// Consecutive timeouts before a player is removed from rotation.
    pub auto_play_limit: u32,

    pub replenish_policy: ReplenishPolicy,

    pub balance_kind: BalanceKind,

    /// Delay between completion and the room being torn down.
    pub cleanup_delay: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            visibility: Visibility::Public,
            capacity: 4,
            stake_amount: 50,
            turn_duration: 15,
            round_duration: 600,
            shuffle_limit: 3,
            ready_grace: 5,
            waiting_timeout: 120,
            match_settle_ms: 1500,
            vote_window: 10,
            auto_play_limit: 2,
            replenish_policy: ReplenishPolicy::EmptyHandOnly,
            balance_kind: BalanceKind::Main,
            cleanup_delay: 30,
        }
    }
}

/// Longest any single room duration may be configured to.
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Seconds as a `TimeDelta`, saturating at [`MAX_DURATION_SECS`].
fn bounded_seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs.min(MAX_DURATION_SECS))
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::zero())
}

fn bounded_millis(millis: u64) -> TimeDelta {
    i64::try_from(millis.min(MAX_DURATION_SECS * 1_000))
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::zero())
}

fn bounded_duration(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_DURATION_SECS))
}

impl RoomConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_PLAYERS..=MAX_CAPACITY).contains(&self.capacity) {
            return Err(format!(
                "Capacity must be between {MIN_PLAYERS} and {MAX_CAPACITY}"
            ));
        }

        if self.stake_amount <= 0 {
            return Err("Stake amount must be positive".to_string());
        }

        if self.turn_duration == 0 || self.turn_duration > 300 {
            return Err("Turn duration must be between 1 and 300 seconds".to_string());
        }

        if self.round_duration < self.turn_duration {
            return Err("Round duration must be at least one turn".to_string());
        }

        if self.waiting_timeout == 0 {
            return Err("Waiting timeout must be positive".to_string());
        }

        if self.vote_window == 0 {
            return Err("Vote window must be positive".to_string());
        }

        if self.auto_play_limit == 0 {
            return Err("Auto-play limit must be at least 1".to_string());
        }

        let durations = [
            ("Round duration", self.round_duration),
            ("Ready grace", self.ready_grace),
            ("Waiting timeout", self.waiting_timeout),
            ("Vote window", self.vote_window),
            ("Cleanup delay", self.cleanup_delay),
            ("Match settle", self.match_settle_ms / 1_000),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs > MAX_DURATION_SECS) {
            return Err(format!("{name} must be at most {MAX_DURATION_SECS} seconds"));
        }

        Ok(())
    }

    pub fn ready_grace(&self) -> Duration {
        bounded_duration(self.ready_grace)
    }

    pub fn waiting_timeout(&self) -> Duration {
        bounded_duration(self.waiting_timeout)
    }

    pub fn cleanup_delay(&self) -> Duration {
        bounded_duration(self.cleanup_delay)
    }

    pub fn vote_window(&self) -> TimeDelta {
        bounded_seconds(self.vote_window)
    }
}

impl From<&RoomConfig> for GameSettings {
    fn from(config: &RoomConfig) -> Self {
        Self {
            capacity: config.capacity,
            stake: config.stake_amount,
            turn_duration: bounded_seconds(config.turn_duration),
            round_duration: bounded_seconds(config.round_duration),
            match_settle: bounded_millis(config.match_settle_ms),
            shuffle_limit: config.shuffle_limit,
            replenish_policy: config.replenish_policy,
        }
    }
}

/// Settings shared by every room in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Price of one extra shuffle.
    pub shuffle_price: Amount,
    /// Lets clients reveal every hand in their own view.
    pub allow_debug_mode: bool,
    /// Bound on each room's inbox.
    pub inbox_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            shuffle_price: 10,
            allow_debug_mode: false,
            inbox_capacity: 100,
        }
    }
}
