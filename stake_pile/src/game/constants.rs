//! Engine-wide limits and defaults.

/// Cards in one standard deck. Every injected deck has this size.
pub const DECK_SIZE: usize = 52;

/// Fewest players that can start a game.
pub const MIN_PLAYERS: usize = 2;

/// Largest room capacity. Keeps at least six cards per hand on the deal.
pub const MAX_CAPACITY: usize = 8;

/// Usernames are truncated to this many characters.
pub const MAX_USERNAME_LENGTH: usize = 16;

/// Length of the human-friendly room join code.
pub const ROOM_CODE_LENGTH: usize = 6;

/// Alphabet used for room codes (no 0/O or 1/I to avoid misreads).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
