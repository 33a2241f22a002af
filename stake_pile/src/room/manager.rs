//! Room registry for spawning and tracking room actors.

use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use super::{
    actor::{RoomActor, RoomHandle},
    config::{EngineSettings, RoomConfig, Visibility},
    messages::{JoinOutcome, RoomError, RoomId, RoomInfo, RoomResult, Seat},
};
use crate::{
    db::{DirectoryError, RoomDirectory, RoomRecord},
    game::{
        RoomStatus,
        constants::{ROOM_CODE_ALPHABET, ROOM_CODE_LENGTH},
    },
    net::messages::ServerEvent,
    wallet::BalanceService,
};

/// Attempts at finding an unused join code before giving up.
const CODE_ATTEMPTS: usize = 16;

/// Random join code, e.g. `K7QX2M`.
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Registry of live rooms. Cloning shares the same rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    balance: Arc<dyn BalanceService>,
    directory: Arc<dyn RoomDirectory>,
    settings: EngineSettings,

    /// Active room handles
    rooms: Arc<RwLock<HashMap<RoomId, RoomHandle>>>,
}

impl RoomRegistry {
    pub fn new(
        balance: Arc<dyn BalanceService>,
        directory: Arc<dyn RoomDirectory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            balance,
            directory,
            settings,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Create and spawn a room with the given id.
    pub async fn create(&self, id: RoomId, config: RoomConfig) -> RoomResult<RoomHandle> {
        config.validate().map_err(RoomError::InvalidConfig)?;

        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&id) {
            return Err(RoomError::DuplicateRoom);
        }
        let code = (0..CODE_ATTEMPTS)
            .map(|_| generate_room_code())
            .find(|code| rooms.values().all(|h| h.code() != code.as_str()))
            .ok_or(RoomError::DuplicateRoom)?;

        let (actor, handle) = RoomActor::new(
            id,
            code.clone(),
            config.clone(),
            self.settings.clone(),
            self.balance.clone(),
            self.directory.clone(),
        );
        rooms.insert(id, handle.clone());
        drop(rooms);

        let record = RoomRecord {
            id,
            code: code.clone(),
            visibility: config.visibility,
            capacity: config.capacity as i32,
            stake_amount: config.stake_amount,
            status: RoomStatus::Waiting,
            created_at: Utc::now(),
        };
        match self.directory.create_room_record(&record).await {
            Ok(()) => {}
            Err(DirectoryError::DuplicateCode(code)) => {
                warn!("Room {}: code {} already listed elsewhere", id, code);
            }
            Err(e) => warn!("Room {}: failed to list in directory: {}", id, e),
        }

        // The actor leaves the registry on its own once it stops.
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            actor.run().await;
            rooms.write().await.remove(&id);
        });

        info!("Created room {} ({})", id, code);
        Ok(handle)
    }

    /// Create a room and seat its creator, who pays the stake and becomes
    /// host. The room is torn down if the creator can't be seated.
    pub async fn create_room(
        &self,
        seat: Seat,
        events: mpsc::Sender<ServerEvent>,
        config: RoomConfig,
    ) -> RoomResult<(RoomHandle, JoinOutcome)> {
        let id = Uuid::new_v4();
        let handle = self.create(id, config).await?;
        match handle.join(seat, events).await {
            Ok(outcome) => Ok((handle, outcome)),
            Err(e) => {
                if let Err(close_err) = handle.close().await {
                    warn!("Room {}: failed to close after creator join failed: {}", id, close_err);
                }
                self.remove(id).await;
                Err(e)
            }
        }
    }

    /// Get a room handle
    pub async fn get(&self, id: RoomId) -> RoomResult<RoomHandle> {
        self.rooms
            .read()
            .await
            .get(&id)
            .filter(|h| !h.is_closed())
            .cloned()
            .ok_or(RoomError::RoomNotFound)
    }

    /// Look a room up by join code, ignoring case.
    pub async fn get_by_code(&self, code: &str) -> RoomResult<RoomHandle> {
        let code = code.trim().to_ascii_uppercase();
        self.rooms
            .read()
            .await
            .values()
            .find(|h| h.code() == code && !h.is_closed())
            .cloned()
            .ok_or(RoomError::RoomNotFound)
    }

    /// Forget a room without closing it.
    pub async fn remove(&self, id: RoomId) -> Option<RoomHandle> {
        self.rooms.write().await.remove(&id)
    }

    /// Close a room and wait for it to stop.
    pub async fn close(&self, id: RoomId) -> RoomResult<()> {
        let handle = self.get(id).await?;
        let result = handle.close().await;
        self.remove(id).await;
        result
    }

    /// Public rooms, newest first.
    pub async fn list_public(&self) -> Vec<RoomInfo> {
        let handles: Vec<RoomHandle> = self
            .rooms
            .read()
            .await
            .values()
            .filter(|h| h.config().visibility == Visibility::Public)
            .cloned()
            .collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            // Rooms that stop between the snapshot and the query are skipped.
            if let Ok(info) = handle.info().await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    /// Get active room count
    pub async fn active_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Close every room. Used on server shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.write().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!("Room {}: close on shutdown failed: {}", handle.room_id(), e);
            }
        }
        info!("Closed {} rooms", count);
    }
}
