//! Room actor message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::config::Visibility;
use crate::game::{
    GameError, RoomStatus,
    entities::{Amount, CardId, GameView, SessionId, UserId, Username},
};
use crate::net::messages::ServerEvent;
use crate::wallet::WalletError;

pub type RoomId = Uuid;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Room already exists")]
    DuplicateRoom,

    #[error("Room is closed")]
    RoomClosed,

    #[error("Invalid room configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("You are not in a room")]
    NotInRoom,

    #[error("You are already in another room")]
    AlreadyInRoom,

    #[error("Debug mode is disabled on this server")]
    DebugModeDisabled,

    #[error("Player id does not match the session")]
    PlayerMismatch,
}

impl RoomError {
    /// Stable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::DuplicateRoom => "DUPLICATE_ROOM",
            Self::RoomClosed => "ROOM_CLOSED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Game(e) => e.code(),
            Self::Wallet(e) => e.code(),
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::AlreadyInRoom => "ALREADY_IN_ROOM",
            Self::DebugModeDisabled => "DEBUG_MODE_DISABLED",
            Self::PlayerMismatch => "PLAYER_MISMATCH",
        }
    }

    /// Message safe to show a client. Ledger internals are never leaked.
    pub fn client_message(&self) -> String {
        match self {
            Self::Wallet(e) => e.client_message(),
            other => other.to_string(),
        }
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

/// Who is taking a seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub user_id: UserId,
    pub username: Username,
    pub session_id: SessionId,
}

/// Public summary of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: RoomId,
    pub code: String,
    pub visibility: Visibility,
    pub capacity: usize,
    pub stake_amount: Amount,
    pub status: RoomStatus,
    pub player_count: usize,
    pub host_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub info: RoomInfo,
    /// The user already had a seat and was rebound to the new session.
    pub reconnected: bool,
    /// Balance after the stake debit. `None` on reconnect.
    pub balance: Option<Amount>,
}

/// Every pending deadline in a room, plus the server clock to correct
/// client drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub server_time: DateTime<Utc>,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub round_deadline: Option<DateTime<Utc>>,
    pub vote_deadline: Option<DateTime<Utc>>,
    /// Auto-start (or dissolve) time while the room is open.
    pub start_deadline: Option<DateTime<Utc>>,
}

/// Messages that can be sent to a RoomActor
#[derive(Debug)]
pub enum RoomMessage {
    /// Take a seat, or rebind an existing seat to a new session
    Join {
        seat: Seat,
        events: mpsc::Sender<ServerEvent>,
        response: oneshot::Sender<RoomResult<JoinOutcome>>,
    },

    /// Leave the room. Refunds the stake if the game hasn't started.
    Leave {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<()>>,
    },

    /// Connection dropped. The seat is kept.
    Disconnect { session_id: SessionId },

    /// Host asks to start before the room is full
    Start {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<()>>,
    },

    PlayCard {
        user_id: UserId,
        card_id: CardId,
        response: oneshot::Sender<RoomResult<()>>,
    },

    /// Play the first card of the hand
    Hit {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<()>>,
    },

    ShuffleHand {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<u32>>,
    },

    /// Buy one extra shuffle
    PurchaseShuffle {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<u32>>,
    },

    /// Open a replenishment vote
    RequestVote {
        user_id: UserId,
        response: oneshot::Sender<RoomResult<()>>,
    },

    SubmitVote {
        user_id: UserId,
        approve: bool,
        response: oneshot::Sender<RoomResult<()>>,
    },

    /// Current deadlines, also pushed to the session as `timer:sync`
    SyncTimers {
        session_id: SessionId,
        response: oneshot::Sender<RoomResult<TimerSnapshot>>,
    },

    SetDebugMode {
        session_id: SessionId,
        enabled: bool,
        response: oneshot::Sender<RoomResult<()>>,
    },

    GetInfo {
        response: oneshot::Sender<RoomInfo>,
    },

    /// Snapshot as seen by `user_id` (spectator view when `None`)
    GetView {
        user_id: Option<UserId>,
        response: oneshot::Sender<GameView>,
    },

    /// Tear the room down, refunding stakes if no game ran
    Close {
        response: Option<oneshot::Sender<()>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletError;

    #[test]
    fn test_codes_pass_through_inner_errors() {
        assert_eq!(RoomError::Game(GameError::NotYourTurn).code(), "NOT_YOUR_TURN");
        assert_eq!(
            RoomError::Wallet(WalletError::InsufficientFunds {
                user_id: 1,
                available: 0,
                required: 50,
            })
            .code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(RoomError::RoomNotFound.code(), "ROOM_NOT_FOUND");
    }

    #[test]
    fn test_client_message_hides_database_details() {
        let err = RoomError::Wallet(WalletError::Database(sqlx::Error::PoolTimedOut));
        assert!(!err.client_message().contains("pool"));
    }

    #[test]
    fn test_timer_snapshot_is_camel_case() {
        let snapshot = TimerSnapshot {
            server_time: Utc::now(),
            turn_deadline: None,
            round_deadline: None,
            vote_deadline: None,
            start_deadline: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("serverTime").is_some());
        assert!(json.get("turnDeadline").is_some());
    }
}
