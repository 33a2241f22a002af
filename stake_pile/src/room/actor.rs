//! Room actor implementation with async message handling.
//!
//! Each room owns its [`GameState`] and is driven by a single task, so
//! every mutation of one room is serialized through its inbox. Balance
//! calls are awaited inside the handler that needs them: a flow validates
//! before the debit and refunds if the in-memory step fails afterwards.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use uuid::Uuid;

use super::{
    config::{EngineSettings, RoomConfig},
    messages::{JoinOutcome, RoomError, RoomId, RoomInfo, RoomMessage, RoomResult, Seat, TimerSnapshot},
    payout::PayoutTrigger,
    timers::{TimerCoordinator, TimerKind},
};
use crate::{
    db::RoomDirectory,
    game::{
        AutoPlayMonitor, AutoPlayVerdict, GameError, GameEvent, GameSettings, GameState,
        PlayResult, RoomStatus, Terminal, VoteCoordinator, VoteResult,
        constants::MIN_PLAYERS,
        entities::{Amount, CardId, GameView, SessionId, UserId},
    },
    net::messages::ServerEvent,
    wallet::{BalanceService, EntryReason, RetryPolicy, with_retry},
};

/// Room actor handle for sending messages
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    room_id: RoomId,
    code: String,
    config: RoomConfig,
}

impl RoomHandle {
    pub fn new(sender: mpsc::Sender<RoomMessage>, room_id: RoomId, code: String, config: RoomConfig) -> Self {
        Self {
            sender,
            room_id,
            code,
            config,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send a message to the room
    pub async fn send(&self, message: RoomMessage) -> RoomResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RoomError::RoomClosed)
    }

    /// Send a message carrying a responder and wait for the answer.
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RoomMessage) -> RoomResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    pub async fn join(&self, seat: Seat, events: mpsc::Sender<ServerEvent>) -> RoomResult<JoinOutcome> {
        self.request(|response| RoomMessage::Join {
            seat,
            events,
            response,
        })
        .await?
    }

    pub async fn leave(&self, user_id: UserId) -> RoomResult<()> {
        self.request(|response| RoomMessage::Leave { user_id, response })
            .await?
    }

    pub async fn disconnect(&self, session_id: SessionId) -> RoomResult<()> {
        self.send(RoomMessage::Disconnect { session_id }).await
    }

    pub async fn start(&self, user_id: UserId) -> RoomResult<()> {
        self.request(|response| RoomMessage::Start { user_id, response })
            .await?
    }

    pub async fn play_card(&self, user_id: UserId, card_id: CardId) -> RoomResult<()> {
        self.request(|response| RoomMessage::PlayCard {
            user_id,
            card_id,
            response,
        })
        .await?
    }

    pub async fn hit(&self, user_id: UserId) -> RoomResult<()> {
        self.request(|response| RoomMessage::Hit { user_id, response })
            .await?
    }

    /// Returns the shuffles left.
    pub async fn shuffle_hand(&self, user_id: UserId) -> RoomResult<u32> {
        self.request(|response| RoomMessage::ShuffleHand { user_id, response })
            .await?
    }

    /// Returns the purchased shuffles now available.
    pub async fn purchase_shuffle(&self, user_id: UserId) -> RoomResult<u32> {
        self.request(|response| RoomMessage::PurchaseShuffle { user_id, response })
            .await?
    }

    pub async fn request_vote(&self, user_id: UserId) -> RoomResult<()> {
        self.request(|response| RoomMessage::RequestVote { user_id, response })
            .await?
    }

    pub async fn submit_vote(&self, user_id: UserId, approve: bool) -> RoomResult<()> {
        self.request(|response| RoomMessage::SubmitVote {
            user_id,
            approve,
            response,
        })
        .await?
    }

    pub async fn sync_timers(&self, session_id: SessionId) -> RoomResult<TimerSnapshot> {
        self.request(|response| RoomMessage::SyncTimers {
            session_id,
            response,
        })
        .await?
    }

    pub async fn set_debug_mode(&self, session_id: SessionId, enabled: bool) -> RoomResult<()> {
        self.request(|response| RoomMessage::SetDebugMode {
            session_id,
            enabled,
            response,
        })
        .await?
    }

    pub async fn info(&self) -> RoomResult<RoomInfo> {
        self.request(|response| RoomMessage::GetInfo { response })
            .await
    }

    pub async fn view(&self, user_id: Option<UserId>) -> RoomResult<GameView> {
        self.request(|response| RoomMessage::GetView { user_id, response })
            .await
    }

    /// Close the room and wait until it is torn down.
    pub async fn close(&self) -> RoomResult<()> {
        self.request(|response| RoomMessage::Close {
            response: Some(response),
        })
        .await
    }
}

/// A connection listening to this room.
#[derive(Debug)]
struct Subscriber {
    user_id: UserId,
    sender: mpsc::Sender<ServerEvent>,
    /// Every hand is revealed in this subscriber's snapshots.
    debug: bool,
}

/// Event waiting to be delivered once the current message is handled.
#[derive(Debug)]
enum Outbound {
    All(ServerEvent),
    User(UserId, ServerEvent),
    Session(SessionId, ServerEvent),
}

/// Room actor managing a single room and its game
pub struct RoomActor {
    id: RoomId,
    code: String,
    config: RoomConfig,
    engine: EngineSettings,
    created_at: DateTime<Utc>,

    state: GameState,
    timers: TimerCoordinator,
    votes: VoteCoordinator,
    autoplay: AutoPlayMonitor,
    payout: PayoutTrigger,

    balance: Arc<dyn BalanceService>,
    directory: Arc<dyn RoomDirectory>,
    retry: RetryPolicy,

    /// Message inbox
    inbox: mpsc::Receiver<RoomMessage>,

    /// Subscribers keyed by session
    subscribers: HashMap<SessionId, Subscriber>,

    /// Join-stake idempotency key per seated user, for refunds
    stakes: HashMap<UserId, String>,

    outbox: Vec<Outbound>,

    /// A snapshot is owed to every subscriber.
    dirty: bool,

    /// Last status written to the directory
    last_status: RoomStatus,

    is_closed: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl RoomActor {
    /// Create a new room actor
    ///
    /// # Returns
    ///
    /// * `(RoomActor, RoomHandle)` - Actor and handle for sending messages
    pub fn new(
        id: RoomId,
        code: String,
        config: RoomConfig,
        engine: EngineSettings,
        balance: Arc<dyn BalanceService>,
        directory: Arc<dyn RoomDirectory>,
    ) -> (Self, RoomHandle) {
        let (sender, inbox) = mpsc::channel(engine.inbox_capacity.max(1));
        let retry = RetryPolicy::default();

        let actor = Self {
            id,
            code: code.clone(),
            state: GameState::new(GameSettings::from(&config)),
            timers: TimerCoordinator::new(),
            votes: VoteCoordinator::new(config.vote_window()),
            autoplay: AutoPlayMonitor::new(config.auto_play_limit),
            payout: PayoutTrigger::new(id, balance.clone(), config.balance_kind, retry),
            created_at: Utc::now(),
            engine,
            balance,
            directory,
            retry,
            inbox,
            subscribers: HashMap::new(),
            stakes: HashMap::new(),
            outbox: Vec::new(),
            dirty: false,
            last_status: RoomStatus::Waiting,
            is_closed: false,
            close_acks: Vec::new(),
            config: config.clone(),
        };

        let handle = RoomHandle::new(sender, id, code, config);
        (actor, handle)
    }

    /// Use a seeded shuffler, for deterministic games.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state = GameState::with_seed(GameSettings::from(&self.config), seed);
        self
    }

    /// Override the retry policy for balance calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.payout = PayoutTrigger::new(self.id, self.balance.clone(), self.config.balance_kind, retry);
        self
    }

    /// Run the room actor event loop
    pub async fn run(mut self) {
        info!("Room {} ({}) starting", self.id, self.code);
        self.timers
            .arm_after(TimerKind::Waiting, self.config.waiting_timeout());

        loop {
            let next = self.timers.next_deadline();
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("Room {}: every handle dropped", self.id);
                        self.close_room().await;
                    }
                },

                () = sleep_until(next) => {
                    for kind in self.timers.take_expired(Instant::now()) {
                        self.on_timer(kind).await;
                        if self.is_closed {
                            break;
                        }
                    }
                }
            }

            self.flush().await;
            if self.is_closed {
                break;
            }
        }

        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
        info!("Room {} ({}) closed", self.id, self.code);
    }

    /// Handle a room message
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                seat,
                events,
                response,
            } => {
                let result = self.handle_join(seat, events).await;
                self.reply(response, result).await;
            }

            RoomMessage::Leave { user_id, response } => {
                let result = self.handle_leave(user_id).await;
                self.reply(response, result).await;
            }

            RoomMessage::Disconnect { session_id } => self.handle_disconnect(session_id),

            RoomMessage::Start { user_id, response } => {
                let result = self.handle_start(user_id);
                self.reply(response, result).await;
            }

            RoomMessage::PlayCard {
                user_id,
                card_id,
                response,
            } => {
                let now = Utc::now();
                let result = match self.state.play_card(user_id, card_id, now) {
                    Ok(play) => {
                        self.after_play(play, now).await;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
                self.reply(response, result).await;
            }

            RoomMessage::Hit { user_id, response } => {
                let now = Utc::now();
                let result = match self.state.hit(user_id, now) {
                    Ok(play) => {
                        self.after_play(play, now).await;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
                self.reply(response, result).await;
            }

            RoomMessage::ShuffleHand { user_id, response } => {
                let result = self
                    .state
                    .shuffle_hand(user_id, Utc::now())
                    .map_err(RoomError::from);
                if result.is_ok() {
                    self.dirty = true;
                }
                self.reply(response, result).await;
            }

            RoomMessage::PurchaseShuffle { user_id, response } => {
                let result = self.handle_purchase_shuffle(user_id).await;
                self.reply(response, result).await;
            }

            RoomMessage::RequestVote { user_id, response } => {
                let result = self.handle_vote_request(user_id).await;
                self.reply(response, result).await;
            }

            RoomMessage::SubmitVote {
                user_id,
                approve,
                response,
            } => {
                let result = self.handle_vote(user_id, approve).await;
                self.reply(response, result).await;
            }

            RoomMessage::SyncTimers {
                session_id,
                response,
            } => {
                let snapshot = self.timer_snapshot();
                self.outbox.push(Outbound::Session(
                    session_id,
                    ServerEvent::TimerSync(snapshot.clone()),
                ));
                self.reply(response, Ok(snapshot)).await;
            }

            RoomMessage::SetDebugMode {
                session_id,
                enabled,
                response,
            } => {
                let result = self.handle_debug_mode(session_id, enabled);
                self.reply(response, result).await;
            }

            RoomMessage::GetInfo { response } => {
                let _ = response.send(self.info());
            }

            RoomMessage::GetView { user_id, response } => {
                let _ = response.send(self.state.view_for(user_id, false));
            }

            RoomMessage::Close { response } => {
                if let Some(response) = response {
                    self.close_acks.push(response);
                }
                self.close_room().await;
            }
        }
    }

    /// Deliver everything this message caused, then answer the caller.
    async fn reply<T>(&mut self, response: oneshot::Sender<T>, value: T) {
        self.flush().await;
        let _ = response.send(value);
    }

    // ------------------------------------------------------------------
    // Seating
    // ------------------------------------------------------------------

    async fn handle_join(&mut self, seat: Seat, events: mpsc::Sender<ServerEvent>) -> RoomResult<JoinOutcome> {
        if self.is_closed {
            return Err(RoomError::RoomClosed);
        }

        let reconnected = self.state.player(seat.user_id).is_some();
        let balance = if reconnected {
            self.state.reconnect(seat.user_id, seat.session_id)?;
            self.subscribers.retain(|_, s| s.user_id != seat.user_id);
            info!("Room {}: user {} reconnected", self.id, seat.user_id);
            None
        } else {
            if !self.state.status().is_open() {
                return Err(GameError::GameAlreadyStarted.into());
            }
            if self.state.player_count() >= self.config.capacity {
                return Err(GameError::RoomFull.into());
            }

            let stake = self.config.stake_amount;
            let kind = self.config.balance_kind;
            let key = format!("stake_{}_{}_{}", self.id, seat.user_id, Uuid::new_v4());
            let balance = with_retry(&self.retry, "stake debit", || {
                self.balance
                    .debit(seat.user_id, stake, kind, EntryReason::Stake, &key)
            })
            .await?;

            if let Err(e) = self.state.add_player(
                seat.user_id,
                seat.session_id,
                seat.username.clone(),
                Utc::now(),
            ) {
                self.refund(seat.user_id, stake, &key).await;
                return Err(e.into());
            }
            self.stakes.insert(seat.user_id, key);
            info!("Room {}: user {} joined with stake {}", self.id, seat.user_id, stake);
            Some(balance)
        };

        self.subscribers.insert(
            seat.session_id,
            Subscriber {
                user_id: seat.user_id,
                sender: events,
                debug: false,
            },
        );
        self.dirty = true;

        let info = self.info();
        self.emit(Outbound::All(ServerEvent::RoomJoined {
            room: info.clone(),
            player_id: seat.user_id,
            username: seat.username,
            reconnected,
        }));
        if let Some(balance) = balance {
            self.emit_balance(seat.user_id, balance, EntryReason::Stake);
        }

        Ok(JoinOutcome {
            info,
            reconnected,
            balance,
        })
    }

    async fn handle_leave(&mut self, user_id: UserId) -> RoomResult<()> {
        let now = Utc::now();
        match self.state.status() {
            RoomStatus::Waiting | RoomStatus::Ready => {
                self.state.remove_player(user_id)?;
                self.dirty = true;
                self.emit(Outbound::All(ServerEvent::PlayerLeft { player_id: user_id }));
                if let Some(key) = self.stakes.remove(&user_id) {
                    if let Some(balance) = self.refund(user_id, self.config.stake_amount, &key).await {
                        self.emit_balance(user_id, balance, EntryReason::Refund);
                    }
                }
                info!("Room {}: user {} left before the game", self.id, user_id);
            }
            RoomStatus::InProgress => {
                let terminal = self.state.forfeit(user_id, now)?;
                self.dirty = true;
                self.emit(Outbound::All(ServerEvent::PlayerLeft { player_id: user_id }));
                info!("Room {}: user {} left mid-game, stake forfeited", self.id, user_id);
                if let Some(terminal) = terminal {
                    self.settle(terminal, now).await;
                }
            }
            RoomStatus::Completed => {
                if self.state.player(user_id).is_none() {
                    return Err(GameError::PlayerNotFound.into());
                }
            }
        }

        // The leaver still gets what this caused, then stops listening.
        self.flush().await;
        self.subscribers.retain(|_, s| s.user_id != user_id);

        if self.state.status().is_open() && self.state.is_empty() {
            self.close_room().await;
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, session_id: SessionId) {
        self.subscribers.remove(&session_id);
        if let Some(user_id) = self.state.disconnect(session_id) {
            info!("Room {}: user {} disconnected", self.id, user_id);
            self.dirty = true;
        }
    }

    fn handle_start(&mut self, user_id: UserId) -> RoomResult<()> {
        if self.state.player(user_id).is_none() {
            return Err(GameError::PlayerNotFound.into());
        }
        if self.state.host().map(|p| p.user_id) != Some(user_id) {
            return Err(GameError::NotHost.into());
        }
        self.state.start_game(Utc::now())?;
        self.dirty = true;
        info!("Room {}: started by host {}", self.id, user_id);
        Ok(())
    }

    fn handle_debug_mode(&mut self, session_id: SessionId, enabled: bool) -> RoomResult<()> {
        if !self.engine.allow_debug_mode {
            return Err(RoomError::DebugModeDisabled);
        }
        let subscriber = self
            .subscribers
            .get_mut(&session_id)
            .ok_or(RoomError::NotInRoom)?;
        subscriber.debug = enabled;
        self.outbox
            .push(Outbound::Session(session_id, ServerEvent::DebugMode { enabled }));
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Play
    // ------------------------------------------------------------------

    async fn after_play(&mut self, play: PlayResult, now: DateTime<Utc>) {
        self.dirty = true;

        if let Some(terminal) = play.terminal {
            self.settle(terminal, now).await;
            return;
        }

        if !play.kind.is_forced() {
            return;
        }
        match self.autoplay.observe(&mut self.state, play.player_id, now) {
            Ok(AutoPlayVerdict::Continue) => {}
            Ok(AutoPlayVerdict::Disabled {
                player_id,
                terminal,
            }) => {
                self.emit(Outbound::All(ServerEvent::PlayerAutoExited { player_id }));
                if let Some(terminal) = terminal {
                    self.settle(terminal, now).await;
                }
            }
            Err(e) => warn!("Room {}: auto-play check failed: {}", self.id, e),
        }
    }

    async fn handle_purchase_shuffle(&mut self, user_id: UserId) -> RoomResult<u32> {
        self.state.ensure_can_purchase_shuffle(user_id)?;

        let price = self.engine.shuffle_price;
        let kind = self.config.balance_kind;
        let key = format!("shuffle_{}_{}_{}", self.id, user_id, Uuid::new_v4());
        let balance = with_retry(&self.retry, "shuffle purchase", || {
            self.balance
                .debit(user_id, price, kind, EntryReason::ShufflePurchase, &key)
        })
        .await?;

        match self.state.grant_extra_shuffle(user_id) {
            Ok(extra) => {
                self.dirty = true;
                self.emit_balance(user_id, balance, EntryReason::ShufflePurchase);
                Ok(extra)
            }
            Err(e) => {
                self.refund(user_id, price, &key).await;
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Replenishment vote
    // ------------------------------------------------------------------

    async fn handle_vote_request(&mut self, user_id: UserId) -> RoomResult<()> {
        let now = Utc::now();
        match self.votes.request(&self.state, user_id, now)? {
            Some(result) => self.resolve_vote(result, now).await,
            None => {
                if let Some(ballot) = self.votes.ballot() {
                    let event = ServerEvent::CardVoteRequest {
                        requester: ballot.requester,
                        eligible: ballot.eligible.clone(),
                        closes_at: ballot.closes_at,
                    };
                    info!(
                        "Room {}: user {} asked for new cards, {} voters",
                        self.id,
                        user_id,
                        ballot.eligible.len()
                    );
                    self.emit(Outbound::All(event));
                }
            }
        }
        Ok(())
    }

    async fn handle_vote(&mut self, user_id: UserId, approve: bool) -> RoomResult<()> {
        if let Some(result) = self.votes.submit(user_id, approve)? {
            self.resolve_vote(result, Utc::now()).await;
        }
        Ok(())
    }

    async fn resolve_vote(&mut self, mut result: VoteResult, now: DateTime<Utc>) {
        if result.approved {
            if let Err(e) = self.apply_replenishment(result.requester, now).await {
                warn!(
                    "Room {}: approved replenishment for {} not applied: {}",
                    self.id, result.requester, e
                );
                result.approved = false;
            }
        }
        info!(
            "Room {}: card vote for {} {} ({} yes / {} no)",
            self.id,
            result.requester,
            if result.approved { "passed" } else { "failed" },
            result.yes,
            result.no
        );
        self.emit(Outbound::All(ServerEvent::CardVoteResult(result)));
    }

    async fn apply_replenishment(&mut self, requester: UserId, now: DateTime<Utc>) -> RoomResult<()> {
        let stake = self.config.stake_amount;
        let kind = self.config.balance_kind;
        let round = self.state.card_replenish_count() + 1;
        let key = format!("replenish_{}_{}_{}", self.id, round, requester);

        let balance = with_retry(&self.retry, "replenish debit", || {
            self.balance
                .debit(requester, stake, kind, EntryReason::Replenish, &key)
        })
        .await?;

        // The game may have moved on while the debit was in flight.
        if let Err(e) = self.state.replenish(requester, now) {
            self.refund(requester, stake, &key).await;
            return Err(e.into());
        }
        self.dirty = true;
        self.emit_balance(requester, balance, EntryReason::Replenish);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn on_timer(&mut self, kind: TimerKind) {
        let now = Utc::now();
        debug!("Room {}: {:?} timer fired", self.id, kind);
        match kind {
            TimerKind::Waiting => self.on_waiting_expired(now).await,
            TimerKind::Round => {
                if let Some(terminal) = self.state.time_up_terminal() {
                    self.settle(terminal, now).await;
                }
            }
            TimerKind::Turn => {
                if self.state.status() != RoomStatus::InProgress {
                    return;
                }
                match self.state.handle_turn_timeout(now) {
                    Ok(play) => self.after_play(play, now).await,
                    Err(e) => warn!("Room {}: turn timeout not applied: {}", self.id, e),
                }
            }
            TimerKind::MatchSettle => {
                if self.state.clear_match_event() {
                    self.dirty = true;
                }
            }
            TimerKind::Ballot => {
                if let Some(result) = self.votes.expire() {
                    self.resolve_vote(result, now).await;
                }
            }
            TimerKind::Cleanup => self.close_room().await,
        }
    }

    /// Waiting countdown or ready grace ran out.
    async fn on_waiting_expired(&mut self, now: DateTime<Utc>) {
        if !self.state.status().is_open() {
            return;
        }
        match self.state.player_count() {
            n if n >= MIN_PLAYERS => match self.state.start_game(now) {
                Ok(()) => {
                    self.dirty = true;
                    info!("Room {}: auto-started with {} players", self.id, n);
                }
                Err(e) => error!("Room {}: auto-start failed: {}", self.id, e),
            },
            1 => self.dissolve("not enough players joined").await,
            _ => self.close_room().await,
        }
    }

    // ------------------------------------------------------------------
    // Money
    // ------------------------------------------------------------------

    /// Complete the game and pay the pool. Later triggers are no-ops.
    async fn settle(&mut self, terminal: Terminal, now: DateTime<Utc>) {
        if let Some(ballot) = self.votes.cancel() {
            info!(
                "Room {}: card vote for {} cancelled by game end",
                self.id, ballot.requester
            );
        }

        match self.payout.settle(&mut self.state, terminal, now).await {
            Ok(settlement) => {
                self.dirty = true;
                if let (Some(winner), Some(balance)) =
                    (settlement.outcome.winner, settlement.new_balance)
                {
                    self.emit_balance(winner, balance, EntryReason::Payout);
                }
                self.timers
                    .arm_after(TimerKind::Cleanup, self.config.cleanup_delay());
            }
            Err(e) => debug!("Room {}: settle skipped: {}", self.id, e),
        }
    }

    /// Credit back a debit identified by `debit_key`. Returns the new
    /// balance, or `None` if the refund could not be made.
    async fn refund(&self, user_id: UserId, amount: Amount, debit_key: &str) -> Option<Amount> {
        let key = format!("refund_{debit_key}");
        let kind = self.config.balance_kind;
        let result = with_retry(&self.retry, "refund", || {
            self.balance
                .credit(user_id, amount, kind, EntryReason::Refund, &key)
        })
        .await;

        match result {
            Ok(balance) => Some(balance),
            Err(e) => {
                error!(
                    "CRITICAL: Failed to refund {} to user {} in room {} (key {}): {}. Funds are stuck!",
                    amount, user_id, self.id, key, e
                );
                None
            }
        }
    }

    /// Return every stake still held by a room that never started.
    async fn refund_stakes(&mut self) {
        let stakes: Vec<(UserId, String)> = self.stakes.drain().collect();
        for (user_id, key) in stakes {
            if let Some(balance) = self.refund(user_id, self.config.stake_amount, &key).await {
                self.emit_balance(user_id, balance, EntryReason::Refund);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn dissolve(&mut self, reason: &str) {
        info!("Room {}: dissolved ({})", self.id, reason);
        self.emit(Outbound::All(ServerEvent::RoomDissolved {
            room_id: self.id,
            reason: reason.to_string(),
        }));
        self.close_room().await;
    }

    /// Stop the room. Stakes of a game that never started go back to the
    /// players; a running game ends on time so the pool is paid out.
    async fn close_room(&mut self) {
        if self.is_closed {
            return;
        }
        let now = Utc::now();
        match self.state.status() {
            RoomStatus::Waiting | RoomStatus::Ready => self.refund_stakes().await,
            RoomStatus::InProgress => {
                if let Some(terminal) = self.state.time_up_terminal() {
                    warn!("Room {}: closed mid-game, settling on time", self.id);
                    self.settle(terminal, now).await;
                }
            }
            RoomStatus::Completed => {}
        }

        self.timers.cancel_all();
        self.votes.cancel();
        self.is_closed = true;

        if let Err(e) = self.directory.delete_room_record(self.id).await {
            warn!("Room {}: failed to delete directory record: {}", self.id, e);
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn emit(&mut self, event: Outbound) {
        // State events raised so far go first.
        self.collect_game_events();
        self.outbox.push(event);
    }

    fn emit_balance(&mut self, user_id: UserId, balance: Amount, reason: EntryReason) {
        self.emit(Outbound::User(
            user_id,
            ServerEvent::BalanceUpdate {
                user_id,
                balance,
                kind: self.config.balance_kind,
                reason,
            },
        ));
    }

    /// Turn drained state events into outbound events and timer changes.
    fn collect_game_events(&mut self) {
        for event in self.state.drain_events() {
            debug!("Room {}: {}", self.id, event);
            match event {
                GameEvent::RoomReady => {
                    let starts_at = self
                        .timers
                        .arm_after(TimerKind::Waiting, self.config.ready_grace());
                    self.outbox.push(Outbound::All(ServerEvent::RoomReady {
                        room_id: self.id,
                        starts_at,
                    }));
                }
                GameEvent::ReturnedToWaiting => {
                    self.timers
                        .arm_after(TimerKind::Waiting, self.config.waiting_timeout());
                }
                GameEvent::GameStarted { turn_order } => {
                    self.timers.cancel(TimerKind::Waiting);
                    let starts: Vec<(SessionId, ServerEvent)> = self
                        .subscribers
                        .iter()
                        .map(|(session_id, sub)| {
                            let event = ServerEvent::GameStart {
                                room_id: self.id,
                                turn_order: turn_order.clone(),
                                state: self.state.view_for(Some(sub.user_id), sub.debug),
                            };
                            (*session_id, event)
                        })
                        .collect();
                    self.outbox.extend(
                        starts
                            .into_iter()
                            .map(|(session_id, event)| Outbound::Session(session_id, event)),
                    );
                }
                GameEvent::TurnChanged {
                    current_player_id,
                    deadline,
                } => self.outbox.push(Outbound::All(ServerEvent::TurnChanged {
                    current_player_id,
                    deadline,
                })),
                GameEvent::CardMatch { player_id, cards } => self
                    .outbox
                    .push(Outbound::All(ServerEvent::CardMatch { player_id, cards })),
                GameEvent::PlayerDisabled { player_id, reason } => self
                    .outbox
                    .push(Outbound::All(ServerEvent::PlayerDisabled { player_id, reason })),
                GameEvent::PlayerEnabled { player_id } => self
                    .outbox
                    .push(Outbound::All(ServerEvent::PlayerEnabled { player_id })),
                GameEvent::GameCompleted(outcome) => {
                    self.outbox.push(Outbound::All(ServerEvent::from(&outcome)));
                }
                GameEvent::HostChanged { .. }
                | GameEvent::CardPlayed { .. }
                | GameEvent::Replenished { .. } => {}
            }
            self.dirty = true;
        }
    }

    /// Point the timers at the deadlines the state and ballot hold now.
    fn sync_timers(&mut self) {
        self.timers
            .sync(TimerKind::Turn, self.state.turn_deadline());
        self.timers
            .sync(TimerKind::Round, self.state.round_deadline());
        self.timers.sync(
            TimerKind::MatchSettle,
            self.state.match_event().map(|m| m.until),
        );
        self.timers.sync(TimerKind::Ballot, self.votes.closes_at());
    }

    async fn sync_directory(&mut self) {
        let status = self.state.status();
        if status == self.last_status || self.is_closed {
            return;
        }
        self.last_status = status;
        if let Err(e) = self.directory.update_status(self.id, status).await {
            warn!("Room {}: failed to record status {}: {}", self.id, status, e);
        }
    }

    /// Deliver pending events and snapshots.
    async fn flush(&mut self) {
        self.collect_game_events();
        if !self.is_closed {
            self.sync_timers();
        }
        self.sync_directory().await;

        if self.dirty {
            self.dirty = false;
            let snapshots: Vec<Outbound> = self
                .subscribers
                .iter()
                .map(|(session_id, sub)| {
                    Outbound::Session(
                        *session_id,
                        ServerEvent::GameStateUpdated {
                            state: self.state.view_for(Some(sub.user_id), sub.debug),
                        },
                    )
                })
                .collect();
            self.outbox.extend(snapshots);
        }

        let mut closed = Vec::new();
        for outbound in self.outbox.drain(..) {
            match outbound {
                Outbound::All(event) => {
                    deliver(&self.subscribers, |_, _| true, &event, &mut closed);
                }
                Outbound::User(user_id, event) => {
                    deliver(&self.subscribers, |_, s| s.user_id == user_id, &event, &mut closed);
                }
                Outbound::Session(session_id, event) => {
                    deliver(&self.subscribers, |id, _| *id == session_id, &event, &mut closed);
                }
            }
        }

        // Remove closed subscribers
        for session_id in closed {
            if self.subscribers.remove(&session_id).is_some() {
                debug!("Room {}: dropped closed subscriber {}", self.id, session_id);
            }
        }
    }

    fn timer_snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            server_time: Utc::now(),
            turn_deadline: self.state.turn_deadline(),
            round_deadline: self.state.round_deadline(),
            vote_deadline: self.votes.closes_at(),
            start_deadline: self
                .state
                .status()
                .is_open()
                .then(|| self.timers.deadline(TimerKind::Waiting))
                .flatten(),
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            code: self.code.clone(),
            visibility: self.config.visibility,
            capacity: self.config.capacity,
            stake_amount: self.config.stake_amount,
            status: self.state.status(),
            player_count: self.state.player_count(),
            host_id: self.state.host().map(|p| p.user_id),
            created_at: self.created_at,
        }
    }
}

/// `try_send` to every matching subscriber, collecting the closed ones.
fn deliver(
    subscribers: &HashMap<SessionId, Subscriber>,
    matches: impl Fn(&SessionId, &Subscriber) -> bool,
    event: &ServerEvent,
    closed: &mut Vec<SessionId>,
) {
    for (session_id, sub) in subscribers.iter().filter(|(id, s)| matches(*id, *s)) {
        match sub.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*session_id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Subscriber {} is not keeping up, dropped {}",
                    session_id,
                    event.name()
                );
            }
        }
    }
}

/// Sleep until `at`, or forever when nothing is armed.
async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
