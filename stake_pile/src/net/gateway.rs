//! Routes client events from one connection to the room it sits in.
//!
//! The gateway holds no game state. It resolves the target room, forwards
//! the request to that room's actor and turns failures into `error`
//! events on the connection's own channel. Room broadcasts travel on the
//! same channel, so a client sees them in the order the room produced
//! them.

use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::{ClientEvent, ServerEvent};
use crate::game::entities::{SessionId, UserId, Username};
use crate::room::{RoomConfig, RoomError, RoomHandle, RoomRegistry, RoomResult, Seat};

/// One client connection.
#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: Username,
    room: Option<RoomHandle>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl Session {
    pub fn new(user_id: UserId, username: Username, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            username,
            room: None,
            outbound,
        }
    }

    pub fn room(&self) -> Option<&RoomHandle> {
        self.room.as_ref()
    }

    fn seat(&self) -> Seat {
        Seat {
            user_id: self.user_id,
            username: self.username.clone(),
            session_id: self.session_id,
        }
    }

    fn current_room(&self) -> RoomResult<&RoomHandle> {
        self.room.as_ref().ok_or(RoomError::NotInRoom)
    }

    async fn send(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!("session {} is gone, dropping reply", self.session_id);
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    registry: RoomRegistry,
    room_defaults: RoomConfig,
}

impl Gateway {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            registry,
            room_defaults: RoomConfig::default(),
        }
    }

    /// Config used for `create_room` requests that carry none.
    pub fn with_room_defaults(mut self, config: RoomConfig) -> Self {
        self.room_defaults = config;
        self
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn room_defaults(&self) -> &RoomConfig {
        &self.room_defaults
    }

    /// Handle one client event. Errors are reported to the client as
    /// `error` events; nothing is returned to the caller.
    pub async fn dispatch(&self, session: &mut Session, event: ClientEvent) {
        debug!("session {} -> {:?}", session.session_id, event);
        if let Err(e) = self.handle(session, event).await {
            if matches!(e, RoomError::RoomClosed) {
                session.room = None;
            }
            debug!("session {} request rejected: {}", session.session_id, e);
            session.send(ServerEvent::from(&e)).await;
        }
    }

    async fn handle(&self, session: &mut Session, event: ClientEvent) -> RoomResult<()> {
        match event {
            ClientEvent::CreateRoom { config } => {
                if session.room.is_some() {
                    return Err(RoomError::AlreadyInRoom);
                }
                let config = config.unwrap_or_else(|| self.room_defaults.clone());
                let (handle, outcome) = self
                    .registry
                    .create_room(session.seat(), session.outbound.clone(), config)
                    .await?;
                info!(
                    "user {} created room {} ({})",
                    session.user_id,
                    handle.room_id(),
                    handle.code()
                );
                session.room = Some(handle);
                session
                    .send(ServerEvent::RoomCreated { room: outcome.info })
                    .await;
            }

            ClientEvent::JoinRoom { room_id, code } => {
                let handle = match (room_id, code) {
                    (Some(id), _) => self.registry.get(id).await?,
                    (None, Some(code)) => self.registry.get_by_code(&code).await?,
                    (None, None) => return Err(RoomError::RoomNotFound),
                };
                if let Some(current) = &session.room {
                    if current.room_id() != handle.room_id() {
                        return Err(RoomError::AlreadyInRoom);
                    }
                }
                handle
                    .join(session.seat(), session.outbound.clone())
                    .await?;
                session.room = Some(handle);
            }

            ClientEvent::LeaveRoom => {
                session.current_room()?.leave(session.user_id).await?;
                session.room = None;
            }

            ClientEvent::StartGame => {
                session.current_room()?.start(session.user_id).await?;
            }

            ClientEvent::PlayCard { player_id, card } => {
                if player_id.is_some_and(|id| id != session.user_id) {
                    return Err(RoomError::PlayerMismatch);
                }
                session
                    .current_room()?
                    .play_card(session.user_id, card.id)
                    .await?;
            }

            ClientEvent::Hit => {
                session.current_room()?.hit(session.user_id).await?;
            }

            ClientEvent::ShuffleDeck => {
                session
                    .current_room()?
                    .shuffle_hand(session.user_id)
                    .await?;
            }

            ClientEvent::PurchaseShuffle => {
                session
                    .current_room()?
                    .purchase_shuffle(session.user_id)
                    .await?;
            }

            ClientEvent::RequestCardVote => {
                session
                    .current_room()?
                    .request_vote(session.user_id)
                    .await?;
            }

            ClientEvent::SubmitCardVote { approve } => {
                session
                    .current_room()?
                    .submit_vote(session.user_id, approve)
                    .await?;
            }

            ClientEvent::RequestTimerSync => {
                session
                    .current_room()?
                    .sync_timers(session.session_id)
                    .await?;
            }

            ClientEvent::SetDebugMode { enabled } => {
                session
                    .current_room()?
                    .set_debug_mode(session.session_id, enabled)
                    .await?;
            }

            ClientEvent::ListRooms => {
                let rooms = self.registry.list_public().await;
                session.send(ServerEvent::RoomList { rooms }).await;
            }
        }
        Ok(())
    }

    /// The connection dropped. The seat is kept for a later reconnect.
    pub async fn disconnect(&self, session: &mut Session) {
        if let Some(room) = session.room.take() {
            if let Err(e) = room.disconnect(session.session_id).await {
                debug!("session {}: room already gone on disconnect: {}", session.session_id, e);
            }
        }
    }
}
