//! Room directory: the persisted list of rooms that clients can browse.
//!
//! Rooms are authoritative in memory. The directory is a best-effort mirror
//! so lobbies and other processes can see what exists; failures are logged
//! by callers and never roll back room state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::timeouts::{TimeoutError, with_default_timeout};
use crate::game::RoomStatus;
use crate::game::entities::Amount;
use crate::room::config::Visibility;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Directory operation timed out")]
    Timeout,

    #[error("Room record {0} not found")]
    NotFound(Uuid),

    #[error("Room code {0} already taken")]
    DuplicateCode(String),
}

impl From<TimeoutError> for DirectoryError {
    fn from(e: TimeoutError) -> Self {
        match e {
            TimeoutError::Timeout(_) => DirectoryError::Timeout,
            TimeoutError::Database(e) => DirectoryError::Database(e),
        }
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: Uuid,
    pub code: String,
    pub visibility: Visibility,
    pub capacity: i32,
    pub stake_amount: Amount,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn create_room_record(&self, record: &RoomRecord) -> DirectoryResult<()>;

    async fn update_status(&self, id: Uuid, status: RoomStatus) -> DirectoryResult<()>;

    async fn delete_room_record(&self, id: Uuid) -> DirectoryResult<()>;

    /// Rooms with the given status (all when `None`), newest first.
    async fn list_rooms(&self, status: Option<RoomStatus>, limit: i64) -> DirectoryResult<Vec<RoomRecord>>;
}

fn parse_status(s: &str) -> RoomStatus {
    match s {
        "ready" => RoomStatus::Ready,
        "in_progress" => RoomStatus::InProgress,
        "completed" => RoomStatus::Completed,
        _ => RoomStatus::Waiting,
    }
}

/// Default PostgreSQL implementation of `RoomDirectory`
pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    async fn create_room_record(&self, record: &RoomRecord) -> DirectoryResult<()> {
        let result = with_default_timeout(
            sqlx::query(
                "INSERT INTO rooms (id, code, visibility, capacity, stake_amount, status, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(record.id)
            .bind(&record.code)
            .bind(record.visibility.to_string())
            .bind(record.capacity)
            .bind(record.stake_amount)
            .bind(record.status.to_string())
            .bind(record.created_at.naive_utc())
            .execute(&self.pool),
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(TimeoutError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                Err(DirectoryError::DuplicateCode(record.code.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, id: Uuid, status: RoomStatus) -> DirectoryResult<()> {
        let result = with_default_timeout(
            sqlx::query("UPDATE rooms SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.to_string())
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(id));
        }
        Ok(())
    }

    async fn delete_room_record(&self, id: Uuid) -> DirectoryResult<()> {
        with_default_timeout(
            sqlx::query("DELETE FROM rooms WHERE id = $1")
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn list_rooms(&self, status: Option<RoomStatus>, limit: i64) -> DirectoryResult<Vec<RoomRecord>> {
        let rows = with_default_timeout(
            sqlx::query(
                "SELECT id, code, visibility, capacity, stake_amount, status, created_at
                 FROM rooms
                 WHERE $1::TEXT IS NULL OR status = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
            )
            .bind(status.map(|s| s.to_string()))
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RoomRecord {
                id: row.get("id"),
                code: row.get("code"),
                visibility: Visibility::parse(row.get::<String, _>("visibility").as_str()),
                capacity: row.get("capacity"),
                stake_amount: row.get("stake_amount"),
                status: parse_status(row.get::<String, _>("status").as_str()),
                created_at: row.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
            })
            .collect())
    }
}

/// In-memory directory for tests and the server's memory mode.
#[derive(Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<HashMap<Uuid, RoomRecord>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<RoomRecord> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn create_room_record(&self, record: &RoomRecord) -> DirectoryResult<()> {
        let mut rooms = self.rooms.write().await;
        if rooms.values().any(|r| r.code == record.code) {
            return Err(DirectoryError::DuplicateCode(record.code.clone()));
        }
        rooms.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: RoomStatus) -> DirectoryResult<()> {
        let mut rooms = self.rooms.write().await;
        let record = rooms.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        record.status = status;
        Ok(())
    }

    async fn delete_room_record(&self, id: Uuid) -> DirectoryResult<()> {
        self.rooms.write().await.remove(&id);
        Ok(())
    }

    async fn list_rooms(&self, status: Option<RoomStatus>, limit: i64) -> DirectoryResult<Vec<RoomRecord>> {
        let rooms = self.rooms.read().await;
        let mut records: Vec<RoomRecord> = rooms
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }
}
