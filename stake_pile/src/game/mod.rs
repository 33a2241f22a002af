//! Card-matching game engine.
//!
//! This module holds everything that runs inside a room without touching
//! I/O:
//! - Card, deck and player entities
//! - The room/game state machine with turn order and match resolution
//! - Inactivity (auto-play) tracking
//! - The replenishment vote

pub mod autoplay;
pub mod constants;
pub mod entities;
pub mod state_machine;
pub mod vote;

pub use autoplay::{AutoPlayMonitor, AutoPlayVerdict};
pub use state_machine::{
    EndReason, GameError, GameEvent, GameOutcome, GameSettings, GameState, PlayOutcome,
    PlayResult, ReplenishPolicy, RoomStatus, Terminal, TurnPolicy,
};
pub use vote::{Ballot, VoteCoordinator, VoteResult};
