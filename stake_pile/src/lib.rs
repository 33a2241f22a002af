//! # Stake Pile
//!
//! Authoritative engine for a turn-based card-matching game played for
//! stakes. Players pay into a shared pool on joining; whoever is left
//! holding cards when everyone else runs out (or holds the most when the
//! clock runs out) takes the pool.
//!
//! ## Rules in short
//!
//! - A 52-card deck is dealt round-robin, starting with the host.
//! - On your turn you put one card on the central pile. If its rank equals
//!   the card underneath, you take the whole pile and play again.
//! - Running out of cards takes you out of the rotation. So does missing
//!   too many turns in a row, or leaving.
//! - A player who ran out can ask for a fresh deck. The other active
//!   players vote; if it passes the requester pays another stake and a new
//!   deck is dealt.
//!
//! ## Core Modules
//!
//! - [`game`]: Entities and the state machine. Pure, no I/O.
//! - [`room`]: One actor per room, timers, payout, and the room registry
//! - [`wallet`]: Balance ledger with idempotent debits and credits
//! - [`db`]: PostgreSQL pool, timeouts and the room directory
//! - [`net`]: JSON event protocol and the gateway that routes it
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use stake_pile::{GameSettings, GameState};
//! use uuid::Uuid;
//!
//! let mut game = GameState::with_seed(GameSettings::default(), 7);
//! game.add_player(1, Uuid::new_v4(), "alice".into(), Utc::now()).unwrap();
//! game.add_player(2, Uuid::new_v4(), "bob".into(), Utc::now()).unwrap();
//! game.start_game(Utc::now()).unwrap();
//! assert_eq!(game.total_cards(), 52);
//! ```

/// Database pool, timeouts and room directory.
pub mod db;

/// Core game logic, entities, and state machine.
pub mod game;
pub use game::{
    GameError, GameSettings, GameState, RoomStatus,
    constants::{self, DECK_SIZE, MAX_CAPACITY, MIN_PLAYERS},
    entities,
};

/// Client event protocol and routing.
pub mod net;
pub use net::{
    gateway::{Gateway, Session},
    messages::{ClientEvent, ServerEvent},
};

/// Room actors and registry.
pub mod room;
pub use room::{RoomConfig, RoomError, RoomHandle, RoomRegistry};

/// Balance ledger.
pub mod wallet;
pub use wallet::{BalanceService, MemoryLedger, WalletError, WalletManager};
