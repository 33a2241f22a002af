use chrono::{DateTime, Utc};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use super::constants::{self, DECK_SIZE};

/// Stable identifier of a user across connections.
pub type UserId = i64;

/// Identifier of a single client connection.
pub type SessionId = Uuid;

/// Identifier of a card. Unique across every deck injected into one game.
pub type CardId = u32;

/// Whole units of the virtual currency.
pub type Amount = i64;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Club,
    Diamond,
    Heart,
    Spade,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Self::Club, Self::Diamond, Self::Heart, Self::Spade];
}

impl fmt::Display for Suit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::Club => "♣",
            Self::Diamond => "♦",
            Self::Heart => "♥",
            Self::Spade => "♠",
        };
        write!(f, "{repr}")
    }
}

/// Card rank. Only equality matters for matching; ordering is kept for
/// stable sorting in views and tests.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Rank {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "9")]
    Nine,
    #[serde(rename = "10")]
    Ten,
    #[serde(rename = "J")]
    Jack,
    #[serde(rename = "Q")]
    Queen,
    #[serde(rename = "K")]
    King,
    #[serde(rename = "A")]
    Ace,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Self::Two,
        Self::Three,
        Self::Four,
        Self::Five,
        Self::Six,
        Self::Seven,
        Self::Eight,
        Self::Nine,
        Self::Ten,
        Self::Jack,
        Self::Queen,
        Self::King,
        Self::Ace,
    ];
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::Two => "2",
            Self::Three => "3",
            Self::Four => "4",
            Self::Five => "5",
            Self::Six => "6",
            Self::Seven => "7",
            Self::Eight => "8",
            Self::Nine => "9",
            Self::Ten => "10",
            Self::Jack => "J",
            Self::Queen => "Q",
            Self::King => "K",
            Self::Ace => "A",
        };
        write!(f, "{repr}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Card {
    pub id: CardId,
    pub suit: Suit,
    pub rank: Rank,
}

impl Card {
    #[must_use]
    pub const fn new(id: CardId, suit: Suit, rank: Rank) -> Self {
        Self { id, suit, rank }
    }

    /// Two cards match when their ranks are equal; suits are ignored.
    #[must_use]
    pub fn matches(&self, other: &Card) -> bool {
        self.rank == other.rank
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = format!("{}{}", self.rank, self.suit);
        write!(f, "{repr:>3}")
    }
}

/// A reference to a card sent by a client. Only the id is authoritative;
/// any suit/rank fields in the payload are ignored.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CardRef {
    pub id: CardId,
}

/// One deck instance. Ids run contiguously from the id the deck was
/// created with.
#[derive(Clone, Debug)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    /// Ordered 52-card deck with ids `first_id..first_id + 52`.
    #[must_use]
    pub fn standard(first_id: CardId) -> Self {
        let mut cards = Vec::with_capacity(DECK_SIZE);
        let mut id = first_id;
        for rank in Rank::ALL {
            for suit in Suit::ALL {
                cards.push(Card::new(id, suit, rank));
                id += 1;
            }
        }
        Self { cards }
    }

    pub fn shuffled<R: Rng + ?Sized>(first_id: CardId, rng: &mut R) -> Self {
        let mut deck = Self::standard(first_id);
        deck.cards.shuffle(rng);
        deck
    }

    /// Wraps cards in a given order. Used to replay or stage a deal.
    #[must_use]
    pub fn from_cards(cards: Vec<Card>) -> Self {
        Self { cards }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Deals round-robin so every hand gets `len / hands` cards. Card `i`
    /// goes to hand `i % hands`. The undealt remainder is returned in deck
    /// order.
    #[must_use]
    pub fn deal_round_robin(self, hands: usize) -> (Vec<Vec<Card>>, Vec<Card>) {
        if hands == 0 {
            return (Vec::new(), self.cards);
        }
        let per_hand = self.cards.len() / hands;
        let dealt = per_hand * hands;
        let mut out: Vec<Vec<Card>> = (0..hands).map(|_| Vec::with_capacity(per_hand)).collect();
        let mut cards = self.cards;
        let remainder = cards.split_off(dealt);
        for (i, card) in cards.into_iter().enumerate() {
            out[i % hands].push(card);
        }
        (out, remainder)
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Username(String);

impl Username {
    pub fn new(s: &str) -> Self {
        let mut username: String = s
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        if let Some((idx, _)) = username.char_indices().nth(constants::MAX_USERNAME_LENGTH) {
            username.truncate(idx);
        }
        Self(username)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(&s))
    }
}

impl From<String> for Username {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for Username {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How a card ended up on the pile.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayKind {
    /// The player picked the card.
    Manual,
    /// The player asked the server to play their first card.
    Hit,
    /// The turn deadline passed and the server played for them.
    Timeout,
}

impl PlayKind {
    /// Only forced plays count toward the auto-play limit.
    #[must_use]
    pub const fn is_forced(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Why a player stopped taking turns.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    HandEmpty,
    AutoPlay,
    Left,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::HandEmpty => "ran out of cards",
            Self::AutoPlay => "missed too many turns",
            Self::Left => "left the room",
        };
        write!(f, "{repr}")
    }
}

#[derive(Clone, Debug)]
pub struct Player {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: Username,
    pub hand: Vec<Card>,
    pub is_host: bool,
    pub is_active: bool,
    pub connected: bool,
    /// Shuffles used in the current replenishment chance.
    pub shuffle_count: u32,
    /// Paid shuffles not yet used.
    pub extra_shuffles: u32,
    /// Consecutive forced plays.
    pub auto_play_count: u32,
    pub last_action_at: DateTime<Utc>,
}

impl Player {
    pub fn new(
        user_id: UserId,
        session_id: SessionId,
        username: Username,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            username,
            hand: Vec::new(),
            is_host: false,
            is_active: true,
            connected: true,
            shuffle_count: 0,
            extra_shuffles: 0,
            auto_play_count: 0,
            last_action_at: now,
        }
    }

    pub fn card_position(&self, card_id: CardId) -> Option<usize> {
        self.hand.iter().position(|c| c.id == card_id)
    }
}

/// Transient marker set while a match settles on clients.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEvent {
    pub active: bool,
    pub card_id: CardId,
    pub player_id: UserId,
    pub until: DateTime<Utc>,
}

/// A player as seen by one viewer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub user_id: UserId,
    pub username: Username,
    pub is_host: bool,
    pub is_active: bool,
    pub connected: bool,
    pub hand_size: usize,
    /// Present only for the viewer's own seat, or for every seat in debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<Card>>,
    pub shuffle_count: u32,
    pub extra_shuffles: u32,
    pub auto_play_count: u32,
}

/// Snapshot of the game broadcast after every mutation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    pub status: super::RoomStatus,
    pub players: Vec<PlayerView>,
    pub current_player_id: Option<UserId>,
    pub pile_top: Option<Card>,
    pub pile_size: usize,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub round_deadline: Option<DateTime<Utc>>,
    pub match_event: Option<MatchEvent>,
    pub card_replenish_count: u32,
    pub stake: Amount,
    pub pool_amount: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use std::collections::HashSet;

    #[test]
    fn test_standard_deck_is_complete_and_unique() {
        let deck = Deck::standard(0);
        assert_eq!(deck.len(), DECK_SIZE);

        let ids: HashSet<CardId> = deck.cards().iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), DECK_SIZE);

        let faces: HashSet<(Suit, Rank)> = deck.cards().iter().map(|c| (c.suit, c.rank)).collect();
        assert_eq!(faces.len(), DECK_SIZE);
    }

    #[test]
    fn test_deck_ids_continue_from_offset() {
        let deck = Deck::standard(52);
        assert_eq!(deck.cards().first().map(|c| c.id), Some(52));
        assert_eq!(deck.cards().last().map(|c| c.id), Some(103));
    }

    #[test]
    fn test_shuffled_deck_is_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let deck = Deck::shuffled(0, &mut rng);
        let mut ids: Vec<CardId> = deck.cards().iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..52).collect::<Vec<_>>());
    }

    #[test]
    fn test_deal_two_hands_splits_evenly() {
        let (hands, rest) = Deck::standard(0).deal_round_robin(2);
        assert_eq!(hands.len(), 2);
        assert_eq!(hands[0].len(), 26);
        assert_eq!(hands[1].len(), 26);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_deal_three_hands_leaves_remainder() {
        let (hands, rest) = Deck::standard(0).deal_round_robin(3);
        assert!(hands.iter().all(|h| h.len() == 17));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 51);
    }

    #[test]
    fn test_deal_is_round_robin() {
        let (hands, _) = Deck::standard(0).deal_round_robin(4);
        assert_eq!(hands[0][0].id, 0);
        assert_eq!(hands[1][0].id, 1);
        assert_eq!(hands[3][0].id, 3);
        assert_eq!(hands[0][1].id, 4);
    }

    #[test]
    fn test_deal_zero_hands_returns_everything() {
        let (hands, rest) = Deck::standard(0).deal_round_robin(0);
        assert!(hands.is_empty());
        assert_eq!(rest.len(), DECK_SIZE);
    }

    #[test]
    fn test_card_match_ignores_suit() {
        let a = Card::new(1, Suit::Heart, Rank::Seven);
        let b = Card::new(2, Suit::Club, Rank::Seven);
        let c = Card::new(3, Suit::Heart, Rank::Eight);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_rank_serializes_as_face() {
        assert_eq!(serde_json::to_string(&Rank::Seven).unwrap(), "\"7\"");
        assert_eq!(serde_json::to_string(&Rank::Queen).unwrap(), "\"Q\"");
        let rank: Rank = serde_json::from_str("\"10\"").unwrap();
        assert_eq!(rank, Rank::Ten);
    }

    #[test]
    fn test_card_ref_ignores_face_fields() {
        let json = r#"{"id": 12, "suit": "heart", "rank": "7"}"#;
        let card: CardRef = serde_json::from_str(json).unwrap();
        assert_eq!(card.id, 12);
    }

    #[test]
    fn test_username_whitespace_and_length() {
        let username = Username::new("  card shark extraordinaire ");
        assert_eq!(username.as_str(), "card_shark_extra");
        assert_eq!(username.as_str().chars().count(), 16);
    }

    #[test]
    fn test_username_multibyte_truncation() {
        let username = Username::new(&"é".repeat(40));
        assert_eq!(username.as_str().chars().count(), 16);
    }

    #[test]
    fn test_only_timeouts_are_forced() {
        assert!(PlayKind::Timeout.is_forced());
        assert!(!PlayKind::Hit.is_forced());
        assert!(!PlayKind::Manual.is_forced());
    }
}
