//! Room module providing concurrent rooms with an async actor model.
//!
//! This module implements:
//! - RoomActor: Async actor owning one room's game state and timers
//! - RoomRegistry: Spawns, finds and tears down rooms
//! - PayoutTrigger: Once-only settlement of a finished game
//! - Message-based communication with tokio channels
//!
//! ## Architecture
//!
//! Each room runs in a separate Tokio task with an mpsc inbox. Handlers
//! run to completion one at a time, so a room never sees two mutations
//! interleave. Timers live inside the actor and are re-armed from the game
//! state after every message.
//!
//! ## Example
//!
//! ```no_run
//! use stake_pile::db::MemoryRoomDirectory;
//! use stake_pile::room::{EngineSettings, RoomConfig, RoomRegistry, Seat};
//! use stake_pile::wallet::MemoryLedger;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = RoomRegistry::new(
//!         Arc::new(MemoryLedger::new().with_default_balance(1_000)),
//!         Arc::new(MemoryRoomDirectory::new()),
//!         EngineSettings::default(),
//!     );
//!
//!     let (events, _rx) = mpsc::channel(64);
//!     let seat = Seat { user_id: 1, username: "alice".into(), session_id: Uuid::new_v4() };
//!     let (room, _) = registry.create_room(seat, events, RoomConfig::default()).await?;
//!     println!("share code {}", room.code());
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod config;
pub mod manager;
pub mod messages;
pub mod payout;
pub mod timers;

pub use actor::{RoomActor, RoomHandle};
pub use config::{EngineSettings, RoomConfig, Visibility};
pub use manager::{RoomRegistry, generate_room_code};
pub use messages::{JoinOutcome, RoomError, RoomId, RoomInfo, RoomMessage, RoomResult, Seat, TimerSnapshot};
pub use payout::{PayoutTrigger, Settlement};
pub use timers::{TimerCoordinator, TimerKind};
