//! Authoritative game state machine for a single room.
//!
//! Rooms move through `waiting -> ready -> in_progress -> completed`. While a
//! game is in progress, the players vector defines turn order and the
//! `current_player_index` always points at an active player when one exists.
//!
//! Every mutation either succeeds completely or returns a [`GameError`]
//! without touching state. Side effects that clients care about are queued
//! as [`GameEvent`]s and drained by the owning room actor.

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt};
use thiserror::Error;

use super::constants::{DECK_SIZE, MIN_PLAYERS};
use super::entities::{
    Amount, Card, CardId, Deck, DisableReason, GameView, MatchEvent, PlayKind, Player,
    PlayerView, SessionId, UserId, Username,
};

/// Errors for rejected game actions. None of these leave partial state.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum GameError {
    #[error("not your turn")]
    NotYourTurn,
    #[error("card {0} is not in your hand")]
    CardNotFound(CardId),
    #[error("your hand is empty")]
    EmptyHand,
    #[error("game is not in progress")]
    GameNotInProgress,
    #[error("game already started")]
    GameAlreadyStarted,
    #[error("need at least two players")]
    NotEnoughPlayers,
    #[error("room is full")]
    RoomFull,
    #[error("player already seated")]
    PlayerAlreadySeated,
    #[error("player not found")]
    PlayerNotFound,
    #[error("player is not active")]
    PlayerInactive,
    #[error("only the host can do that")]
    NotHost,
    #[error("shuffle limit of {limit} reached, purchase an extra shuffle")]
    ShuffleLimitReached { limit: u32 },
    #[error("a card vote is already running")]
    VoteInProgress,
    #[error("no card vote is running")]
    NoVoteInProgress,
    #[error("not eligible to vote on this request")]
    NotEligibleVoter,
    #[error("vote already recorded")]
    AlreadyVoted,
    #[error("not eligible to request new cards")]
    NotEligibleForReplenishment,
    #[error("game already completed")]
    AlreadyCompleted,
    #[error("can't move from {from} to {to}")]
    InvalidTransition { from: RoomStatus, to: RoomStatus },
    #[error("deck must have 52 cards, got {0}")]
    InvalidDeck(usize),
}

impl GameError {
    /// Stable machine-readable code sent to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotYourTurn => "NOT_YOUR_TURN",
            Self::CardNotFound(_) => "CARD_NOT_FOUND",
            Self::EmptyHand => "EMPTY_HAND",
            Self::GameNotInProgress => "GAME_NOT_IN_PROGRESS",
            Self::GameAlreadyStarted => "GAME_ALREADY_STARTED",
            Self::NotEnoughPlayers => "NOT_ENOUGH_PLAYERS",
            Self::RoomFull => "ROOM_FULL",
            Self::PlayerAlreadySeated => "PLAYER_ALREADY_SEATED",
            Self::PlayerNotFound => "PLAYER_NOT_FOUND",
            Self::PlayerInactive => "PLAYER_INACTIVE",
            Self::NotHost => "NOT_HOST",
            Self::ShuffleLimitReached { .. } => "SHUFFLE_LIMIT_REACHED",
            Self::VoteInProgress => "VOTE_IN_PROGRESS",
            Self::NoVoteInProgress => "NO_VOTE_IN_PROGRESS",
            Self::NotEligibleVoter => "NOT_ELIGIBLE_VOTER",
            Self::AlreadyVoted => "ALREADY_VOTED",
            Self::NotEligibleForReplenishment => "NOT_ELIGIBLE_FOR_REPLENISHMENT",
            Self::AlreadyCompleted => "ALREADY_COMPLETED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidDeck(_) => "INVALID_DECK",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Ready,
    InProgress,
    Completed,
}

impl RoomStatus {
    /// Transitions only ever move between neighbouring states. A ready room
    /// can fall back to waiting when someone leaves before the start.
    #[must_use]
    pub const fn can_advance_to(self, next: RoomStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Ready)
                | (Self::Ready, Self::Waiting)
                | (Self::Ready, Self::InProgress)
                | (Self::InProgress, Self::Completed)
        )
    }

    /// Players can still join or leave with a refund.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Waiting | Self::Ready)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        };
        write!(f, "{repr}")
    }
}

/// Who may ask the room for a fresh batch of cards.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplenishPolicy {
    /// Only players who ran out of cards.
    #[default]
    EmptyHandOnly,
    /// Any seated player still in the game, or one who ran out.
    AnyActivePlayer,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Everyone else ran out of cards.
    Normal,
    /// The round duration elapsed.
    TimeUp,
    /// Everyone else left or was removed for inactivity.
    LastPlayerStanding,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::Normal => "normal",
            Self::TimeUp => "time_up",
            Self::LastPlayerStanding => "last_player_standing",
        };
        write!(f, "{repr}")
    }
}

/// A detected end of game that hasn't been settled yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Terminal {
    pub winner: Option<UserId>,
    pub reason: EndReason,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOutcome {
    pub winner: Option<UserId>,
    pub reason: EndReason,
    pub pool_amount: Amount,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlayOutcome {
    /// The card matched the previous top; the whole pile went to the player.
    Matched { pile_size: usize },
    NoMatch,
}

/// What happens to the turn after a play.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TurnPolicy {
    Stay,
    Advance,
}

impl TurnPolicy {
    /// Transition table from play outcome to next-turn policy.
    #[must_use]
    pub const fn for_outcome(outcome: PlayOutcome) -> Self {
        match outcome {
            PlayOutcome::Matched { .. } => Self::Stay,
            PlayOutcome::NoMatch => Self::Advance,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlayResult {
    pub player_id: UserId,
    pub card: Card,
    pub kind: PlayKind,
    pub outcome: PlayOutcome,
    /// Player whose turn it is now, if the game goes on.
    pub next_player_id: Option<UserId>,
    /// Set when this play ended the game; the caller settles it.
    pub terminal: Option<Terminal>,
}

/// Things that happened inside the state machine that clients should hear
/// about.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEvent {
    RoomReady,
    ReturnedToWaiting,
    HostChanged { player_id: UserId },
    GameStarted { turn_order: Vec<UserId> },
    TurnChanged { current_player_id: UserId, deadline: DateTime<Utc> },
    CardPlayed { player_id: UserId, card: Card, kind: PlayKind },
    CardMatch { player_id: UserId, cards: Vec<Card> },
    PlayerDisabled { player_id: UserId, reason: DisableReason },
    PlayerEnabled { player_id: UserId },
    Replenished { requester: UserId, count: u32 },
    GameCompleted(GameOutcome),
}

impl fmt::Display for GameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::RoomReady => "room is full and ready".to_string(),
            Self::ReturnedToWaiting => "room is waiting for players again".to_string(),
            Self::HostChanged { player_id } => format!("{player_id} is now the host"),
            Self::GameStarted { turn_order } => format!("game started with {} players", turn_order.len()),
            Self::TurnChanged { current_player_id, .. } => format!("{current_player_id}'s turn"),
            Self::CardPlayed { player_id, card, kind } => format!("{player_id} played {card} ({kind:?})"),
            Self::CardMatch { player_id, cards } => format!("{player_id} matched and took {} cards", cards.len()),
            Self::PlayerDisabled { player_id, reason } => format!("{player_id} {reason}"),
            Self::PlayerEnabled { player_id } => format!("{player_id} is back in the game"),
            Self::Replenished { requester, count } => format!("new cards dealt for {requester} (#{count})"),
            Self::GameCompleted(outcome) => format!("game over ({})", outcome.reason),
        };
        write!(f, "{repr}")
    }
}

/// Rules a game runs with. Derived from the room configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct GameSettings {
    pub capacity: usize,
    pub stake: Amount,
    pub turn_duration: TimeDelta,
    pub round_duration: TimeDelta,
    pub match_settle: TimeDelta,
    pub shuffle_limit: u32,
    pub replenish_policy: ReplenishPolicy,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            capacity: 4,
            stake: 50,
            turn_duration: TimeDelta::seconds(15),
            round_duration: TimeDelta::minutes(10),
            match_settle: TimeDelta::milliseconds(1500),
            shuffle_limit: 3,
            replenish_policy: ReplenishPolicy::EmptyHandOnly,
        }
    }
}

#[derive(Debug)]
pub struct GameState {
    settings: GameSettings,
    status: RoomStatus,
    /// Turn order.
    players: Vec<Player>,
    current_player_index: usize,
    /// Last card is the top of the pile.
    central_pile: Vec<Card>,
    turn_deadline: Option<DateTime<Utc>>,
    round_deadline: Option<DateTime<Utc>>,
    match_event: Option<MatchEvent>,
    card_replenish_count: u32,
    initial_player_count: usize,
    next_card_id: CardId,
    outcome: Option<GameOutcome>,
    rng: StdRng,
    events: VecDeque<GameEvent>,
}

impl GameState {
    pub fn new(settings: GameSettings) -> Self {
        Self::with_rng(settings, StdRng::from_os_rng())
    }

    /// Deterministic shuffles, for tests and replays.
    pub fn with_seed(settings: GameSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(settings: GameSettings, rng: StdRng) -> Self {
        Self {
            players: Vec::with_capacity(settings.capacity),
            settings,
            status: RoomStatus::Waiting,
            current_player_index: 0,
            central_pile: Vec::new(),
            turn_deadline: None,
            round_deadline: None,
            match_event: None,
            card_replenish_count: 0,
            initial_player_count: 0,
            next_card_id: 0,
            outcome: None,
            rng,
            events: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, user_id: UserId) -> Option<&Player> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn player_by_session(&self, session_id: SessionId) -> Option<&Player> {
        self.players.iter().find(|p| p.session_id == session_id)
    }

    pub fn host(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.is_host)
    }

    pub fn current_player_index(&self) -> usize {
        self.current_player_index
    }

    /// Player whose turn it is. `None` outside of a running game.
    pub fn current_player(&self) -> Option<&Player> {
        if self.status != RoomStatus::InProgress {
            return None;
        }
        self.players
            .get(self.current_player_index)
            .filter(|p| p.is_active)
    }

    pub fn central_pile(&self) -> &[Card] {
        &self.central_pile
    }

    pub fn pile_top(&self) -> Option<&Card> {
        self.central_pile.last()
    }

    pub fn turn_deadline(&self) -> Option<DateTime<Utc>> {
        self.turn_deadline
    }

    pub fn round_deadline(&self) -> Option<DateTime<Utc>> {
        self.round_deadline
    }

    pub fn match_event(&self) -> Option<&MatchEvent> {
        self.match_event.as_ref()
    }

    pub fn card_replenish_count(&self) -> u32 {
        self.card_replenish_count
    }

    pub fn initial_player_count(&self) -> usize {
        self.initial_player_count
    }

    pub fn outcome(&self) -> Option<&GameOutcome> {
        self.outcome.as_ref()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_active).count()
    }

    /// `stake × initial players + stake × replenishments`.
    pub fn pool_amount(&self) -> Amount {
        let stake = self.settings.stake;
        stake * self.initial_player_count as Amount + stake * Amount::from(self.card_replenish_count)
    }

    pub fn drain_events(&mut self) -> VecDeque<GameEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Seating
    // ------------------------------------------------------------------

    /// Seat a new player. The first player becomes host. Filling the last
    /// seat moves the room to `ready`.
    pub fn add_player(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        username: Username,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        if !self.status.is_open() {
            return Err(GameError::GameAlreadyStarted);
        }
        if self.player(user_id).is_some() {
            return Err(GameError::PlayerAlreadySeated);
        }
        if self.players.len() >= self.settings.capacity {
            return Err(GameError::RoomFull);
        }

        let mut player = Player::new(user_id, session_id, username, now);
        player.is_host = self.players.is_empty();
        self.players.push(player);

        if self.players.len() == self.settings.capacity && self.status == RoomStatus::Waiting {
            self.transition(RoomStatus::Ready)?;
            self.events.push_back(GameEvent::RoomReady);
        }
        Ok(())
    }

    /// Bind an already seated player to a new connection.
    pub fn reconnect(&mut self, user_id: UserId, session_id: SessionId) -> Result<(), GameError> {
        let idx = self.index_of(user_id)?;
        let player = &mut self.players[idx];
        player.session_id = session_id;
        player.connected = true;
        Ok(())
    }

    /// Mark the player bound to `session_id` as disconnected. Stale
    /// sessions (already rebound) are ignored.
    pub fn disconnect(&mut self, session_id: SessionId) -> Option<UserId> {
        let player = self.players.iter_mut().find(|p| p.session_id == session_id)?;
        player.connected = false;
        Some(player.user_id)
    }

    /// Remove a player before the game starts. Hands host over to the next
    /// seat and drops a ready room back to waiting.
    pub fn remove_player(&mut self, user_id: UserId) -> Result<Player, GameError> {
        if !self.status.is_open() {
            return Err(GameError::GameAlreadyStarted);
        }
        let idx = self.index_of(user_id)?;
        let removed = self.players.remove(idx);

        if removed.is_host {
            if let Some(next) = self.players.first_mut() {
                next.is_host = true;
                self.events.push_back(GameEvent::HostChanged {
                    player_id: next.user_id,
                });
            }
        }

        if self.status == RoomStatus::Ready {
            self.transition(RoomStatus::Waiting)?;
            self.events.push_back(GameEvent::ReturnedToWaiting);
        }
        Ok(removed)
    }

    /// Move to `ready` if still waiting. Used when a start is requested
    /// before the room filled up.
    pub fn mark_ready(&mut self) -> Result<(), GameError> {
        if self.status == RoomStatus::Ready {
            return Ok(());
        }
        self.transition(RoomStatus::Ready)?;
        self.events.push_back(GameEvent::RoomReady);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Game flow
    // ------------------------------------------------------------------

    /// Start with a freshly shuffled deck.
    pub fn start_game(&mut self, now: DateTime<Utc>) -> Result<(), GameError> {
        let deck = Deck::shuffled(self.next_card_id, &mut self.rng);
        self.start_with_deck(deck, now)
    }

    /// Start with a deck in a known order. Cards are dealt round-robin in
    /// seat order; anything left over seeds the pile.
    pub fn start_with_deck(&mut self, deck: Deck, now: DateTime<Utc>) -> Result<(), GameError> {
        match self.status {
            RoomStatus::InProgress => return Err(GameError::GameAlreadyStarted),
            RoomStatus::Completed => return Err(GameError::AlreadyCompleted),
            RoomStatus::Waiting | RoomStatus::Ready => {}
        }
        if self.players.len() < MIN_PLAYERS {
            return Err(GameError::NotEnoughPlayers);
        }
        if deck.len() != DECK_SIZE {
            return Err(GameError::InvalidDeck(deck.len()));
        }

        self.mark_ready()?;
        self.transition(RoomStatus::InProgress)?;

        self.next_card_id = deck
            .cards()
            .iter()
            .map(|c| c.id + 1)
            .max()
            .unwrap_or(0)
            .max(self.next_card_id);

        let (hands, remainder) = deck.deal_round_robin(self.players.len());
        for (player, hand) in self.players.iter_mut().zip(hands) {
            player.hand = hand;
            player.is_active = true;
            player.shuffle_count = 0;
            player.extra_shuffles = 0;
            player.auto_play_count = 0;
            player.last_action_at = now;
        }
        self.central_pile = remainder;
        self.initial_player_count = self.players.len();
        self.card_replenish_count = 0;
        self.current_player_index = self.players.iter().position(|p| p.is_host).unwrap_or(0);
        self.round_deadline = Some(now + self.settings.round_duration);

        self.events.push_back(GameEvent::GameStarted {
            turn_order: self.players.iter().map(|p| p.user_id).collect(),
        });
        self.reset_turn_deadline(now);
        Ok(())
    }

    /// Play a specific card from the current player's hand.
    pub fn play_card(
        &mut self,
        user_id: UserId,
        card_id: CardId,
        now: DateTime<Utc>,
    ) -> Result<PlayResult, GameError> {
        let idx = self.ensure_turn(user_id)?;
        let pos = self.players[idx]
            .card_position(card_id)
            .ok_or(GameError::CardNotFound(card_id))?;
        Ok(self.play_at(idx, pos, PlayKind::Manual, now))
    }

    /// Play the first card of the current player's hand on their request.
    /// Same path as a timeout, but never counted as an auto-play.
    pub fn hit(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<PlayResult, GameError> {
        let idx = self.ensure_turn(user_id)?;
        if self.players[idx].hand.is_empty() {
            return Err(GameError::EmptyHand);
        }
        Ok(self.play_at(idx, 0, PlayKind::Hit, now))
    }

    /// The turn deadline passed without a play: play the current player's
    /// first card for them.
    pub fn handle_turn_timeout(&mut self, now: DateTime<Utc>) -> Result<PlayResult, GameError> {
        let user_id = self
            .current_player()
            .map(|p| p.user_id)
            .ok_or(GameError::GameNotInProgress)?;
        let idx = self.ensure_turn(user_id)?;
        if self.players[idx].hand.is_empty() {
            return Err(GameError::EmptyHand);
        }
        Ok(self.play_at(idx, 0, PlayKind::Timeout, now))
    }

    fn play_at(&mut self, idx: usize, pos: usize, kind: PlayKind, now: DateTime<Utc>) -> PlayResult {
        let player = &mut self.players[idx];
        let card = player.hand.remove(pos);
        player.last_action_at = now;
        if kind.is_forced() {
            player.auto_play_count += 1;
        } else {
            player.auto_play_count = 0;
        }
        let player_id = player.user_id;

        let previous_top = self.central_pile.last().copied();
        self.central_pile.push(card);
        self.events.push_back(GameEvent::CardPlayed {
            player_id,
            card,
            kind,
        });

        let outcome = match previous_top {
            Some(top) if top.matches(&card) => {
                let won = std::mem::take(&mut self.central_pile);
                let pile_size = won.len();
                self.players[idx].hand.extend(won.iter().copied());
                self.match_event = Some(MatchEvent {
                    active: true,
                    card_id: card.id,
                    player_id,
                    until: now + self.settings.match_settle,
                });
                self.events.push_back(GameEvent::CardMatch {
                    player_id,
                    cards: won,
                });
                PlayOutcome::Matched { pile_size }
            }
            _ => PlayOutcome::NoMatch,
        };

        if self.players[idx].hand.is_empty() {
            self.players[idx].is_active = false;
            self.events.push_back(GameEvent::PlayerDisabled {
                player_id,
                reason: DisableReason::HandEmpty,
            });
        }

        if TurnPolicy::for_outcome(outcome) == TurnPolicy::Advance || !self.players[idx].is_active {
            self.advance_turn();
        }

        let terminal = self.terminal_condition(EndReason::Normal);
        let next_player_id = if terminal.is_none() {
            self.reset_turn_deadline(now);
            self.current_player().map(|p| p.user_id)
        } else {
            None
        };

        debug!(
            "player {} played {} ({:?}) -> {:?}",
            player_id, card, kind, outcome
        );

        PlayResult {
            player_id,
            card,
            kind,
            outcome,
            next_player_id,
            terminal,
        }
    }

    /// Drop the match marker once the settle window is over.
    pub fn clear_match_event(&mut self) -> bool {
        self.match_event.take().is_some()
    }

    /// Take a player out of the turn rotation. Their cards stay with them.
    /// Returns the end of game this caused, if any.
    pub fn deactivate_player(
        &mut self,
        user_id: UserId,
        reason: DisableReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Terminal>, GameError> {
        self.ensure_in_progress()?;
        let idx = self.index_of(user_id)?;
        if !self.players[idx].is_active {
            return Ok(None);
        }
        self.players[idx].is_active = false;
        self.events.push_back(GameEvent::PlayerDisabled {
            player_id: user_id,
            reason,
        });

        let terminal_reason = match reason {
            DisableReason::HandEmpty => EndReason::Normal,
            DisableReason::AutoPlay | DisableReason::Left => EndReason::LastPlayerStanding,
        };
        let terminal = self.terminal_condition(terminal_reason);
        if terminal.is_none() && idx == self.current_player_index {
            self.advance_turn();
            self.reset_turn_deadline(now);
        }
        Ok(terminal)
    }

    /// A player leaves a running game. They keep their seat and cards but
    /// forfeit their stake.
    pub fn forfeit(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<Terminal>, GameError> {
        self.ensure_in_progress()?;
        let idx = self.index_of(user_id)?;
        self.players[idx].connected = false;
        self.deactivate_player(user_id, DisableReason::Left, now)
    }

    // ------------------------------------------------------------------
    // Shuffles
    // ------------------------------------------------------------------

    /// Reorder the player's hand. Returns how many shuffles they have left.
    pub fn shuffle_hand(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<u32, GameError> {
        let idx = self.ensure_active_player(user_id)?;
        let limit = self.settings.shuffle_limit;
        let player = &mut self.players[idx];
        if player.shuffle_count < limit {
            player.shuffle_count += 1;
        } else if player.extra_shuffles > 0 {
            player.extra_shuffles -= 1;
        } else {
            return Err(GameError::ShuffleLimitReached { limit });
        }
        player.hand.shuffle(&mut self.rng);
        player.last_action_at = now;
        Ok(limit.saturating_sub(player.shuffle_count) + player.extra_shuffles)
    }

    /// Checks a shuffle purchase would be usable before any money moves.
    pub fn ensure_can_purchase_shuffle(&self, user_id: UserId) -> Result<(), GameError> {
        self.ensure_active_player(user_id).map(|_| ())
    }

    /// Credit one paid shuffle.
    pub fn grant_extra_shuffle(&mut self, user_id: UserId) -> Result<u32, GameError> {
        let idx = self.ensure_active_player(user_id)?;
        let player = &mut self.players[idx];
        player.extra_shuffles += 1;
        Ok(player.extra_shuffles)
    }

    // ------------------------------------------------------------------
    // Replenishment
    // ------------------------------------------------------------------

    pub fn ensure_can_request_replenishment(&self, user_id: UserId) -> Result<(), GameError> {
        self.ensure_in_progress()?;
        let player = self.player(user_id).ok_or(GameError::PlayerNotFound)?;
        if !player.connected {
            return Err(GameError::NotEligibleForReplenishment);
        }
        let eligible = match self.settings.replenish_policy {
            ReplenishPolicy::EmptyHandOnly => player.hand.is_empty(),
            ReplenishPolicy::AnyActivePlayer => player.is_active || player.hand.is_empty(),
        };
        if eligible {
            Ok(())
        } else {
            Err(GameError::NotEligibleForReplenishment)
        }
    }

    /// Active players other than the requester, in turn order.
    pub fn eligible_voters(&self, requester: UserId) -> Vec<UserId> {
        self.players
            .iter()
            .filter(|p| p.is_active && p.user_id != requester)
            .map(|p| p.user_id)
            .collect()
    }

    /// Deal a fresh deck across the active players after an approved vote.
    /// The requester is brought back into the rotation first. Leftover
    /// cards go under the pile so the top card is unchanged.
    pub fn replenish(&mut self, requester: UserId, now: DateTime<Utc>) -> Result<(), GameError> {
        self.ensure_in_progress()?;
        let idx = self.index_of(requester)?;

        let requester_player = &mut self.players[idx];
        requester_player.auto_play_count = 0;
        requester_player.last_action_at = now;
        if !requester_player.is_active {
            requester_player.is_active = true;
            self.events.push_back(GameEvent::PlayerEnabled {
                player_id: requester,
            });
        }

        let active: Vec<usize> = self
            .players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_active)
            .map(|(i, _)| i)
            .collect();

        let deck = Deck::shuffled(self.next_card_id, &mut self.rng);
        self.next_card_id += DECK_SIZE as CardId;
        let (hands, remainder) = deck.deal_round_robin(active.len());
        for (slot, cards) in active.iter().zip(hands) {
            self.players[*slot].hand.extend(cards);
        }
        self.central_pile.splice(0..0, remainder);
        self.card_replenish_count += 1;
        for player in &mut self.players {
            player.shuffle_count = 0;
        }

        if !self.players[self.current_player_index].is_active {
            self.advance_turn();
            self.reset_turn_deadline(now);
        }

        self.events.push_back(GameEvent::Replenished {
            requester,
            count: self.card_replenish_count,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// End of game if at most one active player is left.
    pub fn terminal_condition(&self, reason: EndReason) -> Option<Terminal> {
        if self.status != RoomStatus::InProgress {
            return None;
        }
        let mut active = self.players.iter().filter(|p| p.is_active);
        match (active.next(), active.next()) {
            (Some(last), None) => Some(Terminal {
                winner: Some(last.user_id),
                reason,
            }),
            (None, _) => Some(Terminal {
                winner: self.card_leader(false),
                reason,
            }),
            _ => None,
        }
    }

    /// Winner when the round clock runs out: most cards among active
    /// players, earliest seat on ties.
    pub fn time_up_terminal(&self) -> Option<Terminal> {
        if self.status != RoomStatus::InProgress {
            return None;
        }
        let winner = self.card_leader(true).or_else(|| self.card_leader(false));
        Some(Terminal {
            winner,
            reason: EndReason::TimeUp,
        })
    }

    /// The round clock ran out: complete with the card leader as winner.
    pub fn finish_by_time(&mut self, now: DateTime<Utc>) -> Result<GameOutcome, GameError> {
        let terminal = self.time_up_terminal().ok_or(if self.status.is_terminal() {
            GameError::AlreadyCompleted
        } else {
            GameError::GameNotInProgress
        })?;
        self.complete(terminal, now)
    }

    fn card_leader(&self, active_only: bool) -> Option<UserId> {
        let mut best: Option<&Player> = None;
        for player in self.players.iter().filter(|p| !active_only || p.is_active) {
            if best.is_none_or(|b| player.hand.len() > b.hand.len()) {
                best = Some(player);
            }
        }
        best.map(|p| p.user_id)
    }

    /// Move to `completed`. This is the single guard against settling a
    /// game twice: only a running game can complete.
    pub fn complete(&mut self, terminal: Terminal, now: DateTime<Utc>) -> Result<GameOutcome, GameError> {
        if self.status.is_terminal() {
            return Err(GameError::AlreadyCompleted);
        }
        self.transition(RoomStatus::Completed)?;

        let outcome = GameOutcome {
            winner: terminal.winner,
            reason: terminal.reason,
            pool_amount: self.pool_amount(),
            completed_at: now,
        };
        self.turn_deadline = None;
        self.round_deadline = None;
        self.match_event = None;
        self.outcome = Some(outcome.clone());
        self.events.push_back(GameEvent::GameCompleted(outcome.clone()));
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Views and invariants
    // ------------------------------------------------------------------

    /// Snapshot for one viewer. Only the viewer's own hand is revealed
    /// unless `reveal_all` is set.
    pub fn view_for(&self, viewer: Option<UserId>, reveal_all: bool) -> GameView {
        let players = self
            .players
            .iter()
            .map(|p| PlayerView {
                user_id: p.user_id,
                username: p.username.clone(),
                is_host: p.is_host,
                is_active: p.is_active,
                connected: p.connected,
                hand_size: p.hand.len(),
                hand: (reveal_all || viewer == Some(p.user_id)).then(|| p.hand.clone()),
                shuffle_count: p.shuffle_count,
                extra_shuffles: p.extra_shuffles,
                auto_play_count: p.auto_play_count,
            })
            .collect();

        GameView {
            status: self.status,
            players,
            current_player_id: self.current_player().map(|p| p.user_id),
            pile_top: self.central_pile.last().copied(),
            pile_size: self.central_pile.len(),
            turn_deadline: self.turn_deadline,
            round_deadline: self.round_deadline,
            match_event: self.match_event.clone(),
            card_replenish_count: self.card_replenish_count,
            stake: self.settings.stake,
            pool_amount: self.pool_amount(),
        }
    }

    pub fn total_cards(&self) -> usize {
        self.players.iter().map(|p| p.hand.len()).sum::<usize>() + self.central_pile.len()
    }

    /// Cards that must exist given how many decks were injected.
    pub fn expected_cards(&self) -> usize {
        if self.initial_player_count == 0 {
            0
        } else {
            DECK_SIZE * (1 + self.card_replenish_count as usize)
        }
    }

    /// Verify the structural invariants. Returns a description of the
    /// first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.total_cards() != self.expected_cards() {
            return Err(format!(
                "card count {} != expected {}",
                self.total_cards(),
                self.expected_cards()
            ));
        }
        if self.status == RoomStatus::InProgress
            && self.active_count() > 0
            && !self
                .players
                .get(self.current_player_index)
                .is_some_and(|p| p.is_active)
        {
            return Err(format!(
                "current index {} is not an active player",
                self.current_player_index
            ));
        }
        if self.turn_deadline.is_some() != (self.status == RoomStatus::InProgress) {
            return Err(format!(
                "turn deadline {:?} with status {}",
                self.turn_deadline, self.status
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(&mut self, next: RoomStatus) -> Result<(), GameError> {
        if !self.status.can_advance_to(next) {
            return Err(GameError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!("room status {} -> {}", self.status, next);
        self.status = next;
        Ok(())
    }

    fn index_of(&self, user_id: UserId) -> Result<usize, GameError> {
        self.players
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(GameError::PlayerNotFound)
    }

    fn ensure_in_progress(&self) -> Result<(), GameError> {
        match self.status {
            RoomStatus::InProgress => Ok(()),
            RoomStatus::Completed => Err(GameError::AlreadyCompleted),
            RoomStatus::Waiting | RoomStatus::Ready => Err(GameError::GameNotInProgress),
        }
    }

    fn ensure_active_player(&self, user_id: UserId) -> Result<usize, GameError> {
        self.ensure_in_progress()?;
        let idx = self.index_of(user_id)?;
        if !self.players[idx].is_active {
            return Err(GameError::PlayerInactive);
        }
        Ok(idx)
    }

    fn ensure_turn(&self, user_id: UserId) -> Result<usize, GameError> {
        self.ensure_in_progress()?;
        let idx = self.index_of(user_id)?;
        if idx != self.current_player_index || !self.players[idx].is_active {
            return Err(GameError::NotYourTurn);
        }
        Ok(idx)
    }

    /// Circular scan for the next active seat after the current one. Stays
    /// put if the current player is the only one left.
    fn advance_turn(&mut self) {
        let n = self.players.len();
        if n == 0 {
            return;
        }
        let from = self.current_player_index;
        if let Some(next) = (1..=n)
            .map(|step| (from + step) % n)
            .find(|&i| self.players[i].is_active)
        {
            self.current_player_index = next;
        }
    }

    fn reset_turn_deadline(&mut self, now: DateTime<Utc>) {
        let deadline = now + self.settings.turn_duration;
        self.turn_deadline = Some(deadline);
        if let Some(current) = self.current_player() {
            self.events.push_back(GameEvent::TurnChanged {
                current_player_id: current.user_id,
                deadline,
            });
        }
    }
}
