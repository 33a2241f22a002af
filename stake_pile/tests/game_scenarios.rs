//! End-to-end game flows driven straight through the state machine.
//!
//! Decks are staged so every deal and every play is predictable. Cards are
//! dealt round-robin in seat order and each player plays their first card,
//! so with a suit-major deck the play sequence is the deck order and no two
//! consecutive plays ever share a rank.

use chrono::{TimeDelta, Utc};
use stake_pile::{
    GameSettings, GameState, RoomStatus,
    entities::{Card, Deck, PlayKind, Rank, Suit, UserId, Username},
    game::{
        AutoPlayMonitor, AutoPlayVerdict, EndReason, GameEvent, PlayOutcome, ReplenishPolicy,
        VoteCoordinator,
    },
};
use uuid::Uuid;

fn seated(n: usize, settings: GameSettings) -> GameState {
    let mut game = GameState::with_seed(settings, 9);
    for id in 1..=n as UserId {
        game.add_player(id, Uuid::new_v4(), Username::new(&format!("p{id}")), Utc::now())
            .unwrap();
    }
    game
}

fn settings(capacity: usize) -> GameSettings {
    GameSettings {
        capacity,
        stake: 50,
        ..GameSettings::default()
    }
}

/// 2♣ 3♣ … A♣ 2♦ 3♦ … A♠, ids 0..52.
fn suit_major_deck() -> Deck {
    let mut cards = Vec::with_capacity(52);
    for suit in Suit::ALL {
        for rank in Rank::ALL {
            cards.push(Card::new(cards.len() as u32, suit, rank));
        }
    }
    Deck::from_cards(cards)
}

/// `front` first, then the rest of the suit-major deck.
fn deck_with_front(front: &[(Rank, Suit)]) -> Deck {
    let mut rest = suit_major_deck().cards().to_vec();
    let mut ordered = Vec::with_capacity(rest.len());
    for (rank, suit) in front {
        let pos = rest
            .iter()
            .position(|c| c.rank == *rank && c.suit == *suit)
            .unwrap();
        ordered.push(rest.remove(pos));
    }
    ordered.extend(rest);
    Deck::from_cards(ordered)
}

fn current(game: &GameState) -> UserId {
    game.current_player().unwrap().user_id
}

fn hand_len(game: &GameState, user_id: UserId) -> usize {
    game.player(user_id).unwrap().hand.len()
}

// ============================================================================
// Two players split the deck evenly
// ============================================================================

#[test]
fn test_two_players_split_deck_evenly() {
    let mut game = seated(2, settings(2));
    assert_eq!(game.status(), RoomStatus::Ready);

    game.start_game(Utc::now()).unwrap();

    assert_eq!(game.status(), RoomStatus::InProgress);
    assert_eq!(hand_len(&game, 1), 26);
    assert_eq!(hand_len(&game, 2), 26);
    assert!(game.central_pile().is_empty());
    assert_eq!(game.pool_amount(), 100);
    assert_eq!(current(&game), 1, "host opens");
    game.check_invariants().unwrap();
}

#[test]
fn test_three_players_leave_remainder_on_pile() {
    let mut game = seated(3, settings(3));
    game.start_game(Utc::now()).unwrap();

    for id in 1..=3 {
        assert_eq!(hand_len(&game, id), 17);
    }
    assert_eq!(game.central_pile().len(), 1);
    game.check_invariants().unwrap();
}

#[test]
fn test_four_players_rotate_round_robin_without_matches() {
    let mut game = seated(4, settings(4));
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();

    let mut visited = Vec::new();
    for _ in 0..12 {
        let player = current(&game);
        visited.push(player);
        let result = game.hit(player, Utc::now()).unwrap();
        assert_eq!(result.outcome, PlayOutcome::NoMatch);
    }

    assert_eq!(visited, [1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
    for id in 1..=4 {
        assert_eq!(hand_len(&game, id), 10);
    }
    assert_eq!(game.central_pile().len(), 12);
    game.check_invariants().unwrap();
}

// ============================================================================
// A missed turn is played for the player
// ============================================================================

#[test]
fn test_turn_timeout_plays_first_card() {
    let mut game = seated(2, settings(2));
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();
    let first = game.player(1).unwrap().hand[0];

    let result = game.handle_turn_timeout(Utc::now()).unwrap();

    assert_eq!(result.player_id, 1);
    assert_eq!(result.card, first);
    assert_eq!(result.kind, PlayKind::Timeout);
    assert_eq!(result.outcome, PlayOutcome::NoMatch);
    assert_eq!(game.player(1).unwrap().auto_play_count, 1);
    assert_eq!(current(&game), 2);
    assert_eq!(game.pile_top(), Some(&first));
}

#[test]
fn test_repeated_timeouts_remove_player() {
    let mut game = seated(3, settings(3));
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();
    let monitor = AutoPlayMonitor::new(2);

    // Player 1 misses two turns; 2 and 3 play normally in between.
    for round in 0..2 {
        let result = game.handle_turn_timeout(Utc::now()).unwrap();
        let verdict = monitor.observe(&mut game, result.player_id, Utc::now()).unwrap();
        if round == 0 {
            assert_eq!(verdict, AutoPlayVerdict::Continue);
        } else {
            assert_eq!(
                verdict,
                AutoPlayVerdict::Disabled {
                    player_id: 1,
                    terminal: None
                }
            );
        }
        if round == 0 {
            game.hit(2, Utc::now()).unwrap();
            game.hit(3, Utc::now()).unwrap();
        }
    }

    assert!(!game.player(1).unwrap().is_active);
    assert_eq!(current(&game), 2);
    game.check_invariants().unwrap();
}

// ============================================================================
// A matching rank takes the whole pile
// ============================================================================

#[test]
fn test_match_takes_pile_and_keeps_turn() {
    let mut game = seated(2, settings(2));
    let deck = deck_with_front(&[
        (Rank::Three, Suit::Club),
        (Rank::Seven, Suit::Spade),
        (Rank::Seven, Suit::Heart),
    ]);
    game.start_with_deck(deck, Utc::now()).unwrap();

    let three = game.player(1).unwrap().hand[0];
    let seven_heart = game.player(1).unwrap().hand[1];
    let seven_spade = game.player(2).unwrap().hand[0];
    assert_eq!(seven_heart.rank, Rank::Seven);

    game.play_card(1, three.id, Utc::now()).unwrap();
    game.play_card(2, seven_spade.id, Utc::now()).unwrap();
    game.drain_events();

    let result = game.play_card(1, seven_heart.id, Utc::now()).unwrap();

    assert_eq!(result.outcome, PlayOutcome::Matched { pile_size: 3 });
    assert!(game.central_pile().is_empty());
    assert_eq!(hand_len(&game, 1), 26 - 2 + 3);
    assert_eq!(current(&game), 1, "matching player keeps the turn");
    assert!(game.match_event().is_some());

    let events = game.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        GameEvent::CardMatch { player_id: 1, cards } if cards.len() == 3
    )));
    game.check_invariants().unwrap();
}

// ============================================================================
// Last player with cards wins the pool
// ============================================================================

#[test]
fn test_emptied_hand_ends_two_player_game() {
    let mut game = seated(2, settings(2));
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();

    let mut plays = 0;
    let terminal = loop {
        let result = game.hit(current(&game), Utc::now()).unwrap();
        plays += 1;
        assert_eq!(result.outcome, PlayOutcome::NoMatch);
        if let Some(terminal) = result.terminal {
            break terminal;
        }
    };

    // Player 1 runs out on their 26th card, which is play 51.
    assert_eq!(plays, 51);
    assert!(!game.player(1).unwrap().is_active);
    assert_eq!(terminal.winner, Some(2));
    assert_eq!(terminal.reason, EndReason::Normal);

    let outcome = game.complete(terminal, Utc::now()).unwrap();
    assert_eq!(outcome.winner, Some(2));
    assert_eq!(outcome.pool_amount, 100);
    assert_eq!(game.status(), RoomStatus::Completed);
    assert!(game.turn_deadline().is_none());
    assert!(game.complete(terminal, Utc::now()).is_err());
}

// ============================================================================
// A passed vote brings the requester back with a fresh deck
// ============================================================================

#[test]
fn test_replenishment_vote_two_to_one() {
    let mut game = seated(4, settings(4));
    assert_eq!(game.settings().replenish_policy, ReplenishPolicy::EmptyHandOnly);
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();

    // Twelve full rounds plus player 1's last card.
    for _ in 0..49 {
        game.hit(current(&game), Utc::now()).unwrap();
    }
    assert_eq!(hand_len(&game, 1), 0);
    assert!(!game.player(1).unwrap().is_active);
    assert_eq!(game.active_count(), 3);
    assert_eq!(current(&game), 2);

    let mut votes = VoteCoordinator::new(TimeDelta::seconds(10));
    assert_eq!(votes.request(&game, 1, Utc::now()).unwrap(), None);
    assert_eq!(votes.ballot().unwrap().eligible, vec![2, 3, 4]);

    assert_eq!(votes.submit(2, true).unwrap(), None);
    assert_eq!(votes.submit(3, true).unwrap(), None);
    let result = votes.submit(4, false).unwrap().unwrap();
    assert!(result.approved);
    assert_eq!((result.yes, result.no), (2, 1));

    game.replenish(1, Utc::now()).unwrap();

    assert!(game.player(1).unwrap().is_active);
    assert_eq!(game.card_replenish_count(), 1);
    assert_eq!(hand_len(&game, 1), 13);
    assert_eq!(hand_len(&game, 2), 1 + 13);
    assert_eq!(game.total_cards(), 104);
    assert_eq!(game.pool_amount(), 4 * 50 + 50);
    game.check_invariants().unwrap();
}

#[test]
fn test_replenishment_vote_rejected_on_tie() {
    let mut game = seated(3, settings(3));
    game.start_with_deck(suit_major_deck(), Utc::now()).unwrap();

    // Player 1 holds 17 cards and 3 seats rotate; 17 rounds empties them.
    for _ in 0..(16 * 3 + 1) {
        game.hit(current(&game), Utc::now()).unwrap();
    }
    assert_eq!(hand_len(&game, 1), 0);

    let mut votes = VoteCoordinator::new(TimeDelta::seconds(10));
    votes.request(&game, 1, Utc::now()).unwrap();
    votes.submit(2, true).unwrap();
    let result = votes.submit(3, false).unwrap().unwrap();

    assert!(!result.approved);
    assert_eq!(game.card_replenish_count(), 0);
    assert!(!game.player(1).unwrap().is_active);
}

#[test]
fn test_player_with_cards_cannot_request_by_default() {
    let mut game = seated(2, settings(2));
    game.start_game(Utc::now()).unwrap();

    let mut votes = VoteCoordinator::new(TimeDelta::seconds(10));
    let err = votes.request(&game, 1, Utc::now()).unwrap_err();
    assert_eq!(err.code(), "NOT_ELIGIBLE_FOR_REPLENISHMENT");
    assert!(!votes.is_open());
}
