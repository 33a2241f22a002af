//! Wire protocol between clients and rooms.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. Field
//! names inside `data` are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::{
    EndReason, GameOutcome, VoteResult,
    entities::{Amount, Card, CardRef, DisableReason, GameView, UserId, Username},
};
use crate::room::{
    config::RoomConfig,
    messages::{RoomError, RoomId, RoomInfo, TimerSnapshot},
};
use crate::wallet::{BalanceKind, EntryReason};

/// Requests a client can send.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Without a config the server's room defaults apply.
    CreateRoom {
        #[serde(default)]
        config: Option<RoomConfig>,
    },
    /// Join by id or by the 6-character code.
    JoinRoom {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        code: Option<String>,
    },
    LeaveRoom,
    StartGame,
    /// `player_id` is optional and must match the session when present.
    PlayCard {
        #[serde(default)]
        player_id: Option<UserId>,
        card: CardRef,
    },
    Hit,
    ShuffleDeck,
    PurchaseShuffle,
    #[serde(alias = "new_card_deck_request")]
    RequestCardVote,
    SubmitCardVote {
        approve: bool,
    },
    #[serde(rename = "timer:request_sync")]
    RequestTimerSync,
    SetDebugMode {
        enabled: bool,
    },
    /// Public rooms only. Private rooms are reached by code.
    ListRooms,
}

/// Events a room or the gateway pushes to a client.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    #[serde(rename = "room:created")]
    RoomCreated { room: RoomInfo },

    #[serde(rename = "room:list")]
    RoomList { rooms: Vec<RoomInfo> },

    #[serde(rename = "room:joined")]
    RoomJoined {
        room: RoomInfo,
        player_id: UserId,
        username: Username,
        reconnected: bool,
    },

    /// Capacity reached; the game starts at `starts_at`.
    #[serde(rename = "room:ready")]
    RoomReady {
        room_id: RoomId,
        starts_at: DateTime<Utc>,
    },

    #[serde(rename = "game:start")]
    GameStart {
        room_id: RoomId,
        turn_order: Vec<UserId>,
        state: GameView,
    },

    GameStateUpdated { state: GameView },

    TurnChanged {
        current_player_id: UserId,
        deadline: DateTime<Utc>,
    },

    CardMatch { player_id: UserId, cards: Vec<Card> },

    PlayerDisabled {
        player_id: UserId,
        reason: DisableReason,
    },

    PlayerEnabled { player_id: UserId },

    PlayerAutoExited { player_id: UserId },

    PlayerLeft { player_id: UserId },

    CardVoteRequest {
        requester: UserId,
        eligible: Vec<UserId>,
        closes_at: DateTime<Utc>,
    },

    CardVoteResult(VoteResult),

    #[serde(rename = "balance:update")]
    BalanceUpdate {
        user_id: UserId,
        balance: Amount,
        kind: BalanceKind,
        reason: EntryReason,
    },

    GameOver {
        winner: Option<UserId>,
        reason: EndReason,
        pool_amount: Amount,
    },

    #[serde(rename = "room:dissolved")]
    RoomDissolved { room_id: RoomId, reason: String },

    #[serde(rename = "timer:sync")]
    TimerSync(TimerSnapshot),

    DebugMode { enabled: bool },

    Error { code: String, message: String },
}

impl ClientEvent {
    /// Wire name, for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::StartGame => "start_game",
            Self::PlayCard { .. } => "play_card",
            Self::Hit => "hit",
            Self::ShuffleDeck => "shuffle_deck",
            Self::PurchaseShuffle => "purchase_shuffle",
            Self::RequestCardVote => "request_card_vote",
            Self::SubmitCardVote { .. } => "submit_card_vote",
            Self::RequestTimerSync => "timer:request_sync",
            Self::SetDebugMode { .. } => "set_debug_mode",
            Self::ListRooms => "list_rooms",
        }
    }
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wire name, for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room:created",
            Self::RoomList { .. } => "room:list",
            Self::RoomJoined { .. } => "room:joined",
            Self::RoomReady { .. } => "room:ready",
            Self::GameStart { .. } => "game:start",
            Self::GameStateUpdated { .. } => "game_state_updated",
            Self::TurnChanged { .. } => "turn_changed",
            Self::CardMatch { .. } => "card_match",
            Self::PlayerDisabled { .. } => "player_disabled",
            Self::PlayerEnabled { .. } => "player_enabled",
            Self::PlayerAutoExited { .. } => "player_auto_exited",
            Self::PlayerLeft { .. } => "player_left",
            Self::CardVoteRequest { .. } => "card_vote_request",
            Self::CardVoteResult(_) => "card_vote_result",
            Self::BalanceUpdate { .. } => "balance:update",
            Self::GameOver { .. } => "game_over",
            Self::RoomDissolved { .. } => "room:dissolved",
            Self::TimerSync(_) => "timer:sync",
            Self::DebugMode { .. } => "debug_mode",
            Self::Error { .. } => "error",
        }
    }
}

impl From<&RoomError> for ServerEvent {
    fn from(e: &RoomError) -> Self {
        Self::error(e.code(), e.client_message())
    }
}

impl From<&GameOutcome> for ServerEvent {
    fn from(outcome: &GameOutcome) -> Self {
        Self::GameOver {
            winner: outcome.winner,
            reason: outcome.reason,
            pool_amount: outcome.pool_amount,
        }
    }
}
