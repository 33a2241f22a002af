//! Room actors driven end to end over the in-memory ledger.
//!
//! Every test runs on a paused clock, so waiting timeouts, ready grace
//! delays and turn timers fire as soon as the room has nothing else to do.

use std::{sync::Arc, time::Duration};

use stake_pile::{
    RoomStatus,
    db::MemoryRoomDirectory,
    game::{EndReason, ReplenishPolicy},
    net::messages::ServerEvent,
    room::{EngineSettings, RoomConfig, RoomHandle, RoomRegistry, Seat},
    wallet::{BalanceKind, BalanceService, EntryReason, MemoryLedger},
};
use tokio::sync::mpsc;
use uuid::Uuid;

const START_BALANCE: i64 = 1_000;

struct Harness {
    registry: RoomRegistry,
    ledger: Arc<MemoryLedger>,
    directory: Arc<MemoryRoomDirectory>,
}

fn harness() -> Harness {
    let ledger = Arc::new(MemoryLedger::new().with_default_balance(START_BALANCE));
    let directory = Arc::new(MemoryRoomDirectory::new());
    let registry = RoomRegistry::new(ledger.clone(), directory.clone(), EngineSettings::default());
    Harness {
        registry,
        ledger,
        directory,
    }
}

fn seat(user_id: i64, name: &str) -> Seat {
    Seat {
        user_id,
        username: name.into(),
        session_id: Uuid::new_v4(),
    }
}

fn config(capacity: usize) -> RoomConfig {
    RoomConfig {
        capacity,
        ..RoomConfig::default()
    }
}

/// Creator plus one more player, each with their own event channel.
async fn two_seated(
    h: &Harness,
    capacity: usize,
) -> (RoomHandle, mpsc::Receiver<ServerEvent>, mpsc::Receiver<ServerEvent>) {
    let (tx1, rx1) = mpsc::channel(1024);
    let (tx2, rx2) = mpsc::channel(1024);
    let (room, _) = h
        .registry
        .create_room(seat(1, "alice"), tx1, config(capacity))
        .await
        .unwrap();
    room.join(seat(2, "bob"), tx2).await.unwrap();
    (room, rx1, rx2)
}

async fn wait_for(
    rx: &mut mpsc::Receiver<ServerEvent>,
    matches: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(1_800), async {
        loop {
            match rx.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("room stopped before the expected event"),
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test(start_paused = true)]
async fn test_join_debits_stake_once() {
    let h = harness();
    let (tx, _rx) = mpsc::channel(64);
    let (room, outcome) = h
        .registry
        .create_room(seat(1, "alice"), tx, config(4))
        .await
        .unwrap();
    assert_eq!(outcome.balance, Some(950));

    let (tx2, _rx2) = mpsc::channel(64);
    let joined = room.join(seat(2, "bob"), tx2).await.unwrap();
    assert!(!joined.reconnected);
    assert_eq!(joined.info.player_count, 2);

    assert_eq!(h.ledger.entries_for(1, EntryReason::Stake).await.len(), 1);
    assert_eq!(h.ledger.entries_for(2, EntryReason::Stake).await.len(), 1);
    assert_eq!(h.ledger.get_balance(2, BalanceKind::Main).await.unwrap(), 950);
}

#[tokio::test(start_paused = true)]
async fn test_full_room_starts_after_grace() {
    let h = harness();
    let (room, mut rx1, _rx2) = two_seated(&h, 2).await;

    wait_for(&mut rx1, |e| matches!(e, ServerEvent::RoomReady { .. })).await;
    let start = wait_for(&mut rx1, |e| matches!(e, ServerEvent::GameStart { .. })).await;
    let ServerEvent::GameStart { turn_order, state, .. } = start else {
        unreachable!()
    };
    assert_eq!(turn_order, vec![1, 2]);
    assert_eq!(state.status, RoomStatus::InProgress);
    assert_eq!(state.pool_amount, 100);

    // Only the viewer's own hand is revealed.
    let own = state.players.iter().find(|p| p.user_id == 1).unwrap();
    let other = state.players.iter().find(|p| p.user_id == 2).unwrap();
    assert_eq!(own.hand.as_ref().map(Vec::len), Some(26));
    assert!(other.hand.is_none());
    assert_eq!(other.hand_size, 26);

    let record = h.directory.get(room.room_id()).await.unwrap();
    assert_eq!(record.status, RoomStatus::InProgress);
}

#[tokio::test(start_paused = true)]
async fn test_idle_game_ends_and_pays_once() {
    let h = harness();
    let (room, mut rx1, _rx2) = two_seated(&h, 2).await;

    let over = wait_for(&mut rx1, |e| matches!(e, ServerEvent::GameOver { .. })).await;
    let ServerEvent::GameOver {
        winner,
        pool_amount,
        ..
    } = over
    else {
        unreachable!()
    };
    let winner = winner.expect("someone is left holding cards");
    assert_eq!(pool_amount, 100);

    let payouts = h.ledger.entries_for(winner, EntryReason::Payout).await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 100);
    assert_eq!(
        h.ledger.get_balance(winner, BalanceKind::Main).await.unwrap(),
        START_BALANCE + 50
    );

    // Torn down once the cleanup delay passes.
    tokio::time::sleep(Duration::from_secs(room.config().cleanup_delay + 1)).await;
    assert!(room.is_closed());
    assert_eq!(h.registry.active_room_count().await, 0);
    assert!(h.directory.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_idle_player_sees_forced_plays() {
    let h = harness();
    let (_room, mut rx1, _rx2) = two_seated(&h, 2).await;

    wait_for(&mut rx1, |e| matches!(e, ServerEvent::GameStart { .. })).await;
    let changed = wait_for(&mut rx1, |e| matches!(e, ServerEvent::TurnChanged { .. })).await;
    let ServerEvent::TurnChanged {
        current_player_id, ..
    } = changed
    else {
        unreachable!()
    };
    // The host opens.
    assert_eq!(current_player_id, 1);

    let forced = wait_for(&mut rx1, |e| match e {
        ServerEvent::GameStateUpdated { state } => state.players.iter().any(|p| p.auto_play_count > 0),
        _ => false,
    })
    .await;
    assert!(matches!(forced, ServerEvent::GameStateUpdated { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_leave_waiting_room_refunds_stake() {
    let h = harness();
    let (room, mut rx1, _rx2) = two_seated(&h, 4).await;

    room.leave(2).await.unwrap();
    wait_for(&mut rx1, |e| {
        matches!(e, ServerEvent::PlayerLeft { player_id: 2 })
    })
    .await;

    assert_eq!(h.ledger.entries_for(2, EntryReason::Refund).await.len(), 1);
    assert_eq!(
        h.ledger.get_balance(2, BalanceKind::Main).await.unwrap(),
        START_BALANCE
    );
    assert_eq!(room.info().await.unwrap().player_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lone_player_dissolves_with_refund() {
    let h = harness();
    let (tx, mut rx) = mpsc::channel(64);
    let (room, _) = h
        .registry
        .create_room(seat(1, "alice"), tx, config(4))
        .await
        .unwrap();

    wait_for(&mut rx, |e| matches!(e, ServerEvent::RoomDissolved { .. })).await;
    let refund = wait_for(&mut rx, |e| {
        matches!(
            e,
            ServerEvent::BalanceUpdate {
                reason: EntryReason::Refund,
                ..
            }
        )
    })
    .await;
    assert!(matches!(
        refund,
        ServerEvent::BalanceUpdate {
            balance: START_BALANCE,
            ..
        }
    ));

    assert!(h.directory.get(room.room_id()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_only_host_starts() {
    let h = harness();
    let (room, _rx1, _rx2) = two_seated(&h, 4).await;

    let err = room.start(2).await.unwrap_err();
    assert_eq!(err.code(), "NOT_HOST");

    room.start(1).await.unwrap();
    let err = room.start(1).await.unwrap_err();
    assert_eq!(err.code(), "GAME_ALREADY_STARTED");
}

#[tokio::test(start_paused = true)]
async fn test_out_of_turn_play_rejected() {
    let h = harness();
    let (room, _rx1, _rx2) = two_seated(&h, 4).await;
    room.start(1).await.unwrap();

    let view = room.view(None).await.unwrap();
    let current = view.current_player_id.unwrap();
    let waiting = if current == 1 { 2 } else { 1 };

    let err = room.hit(waiting).await.unwrap_err();
    assert_eq!(err.code(), "NOT_YOUR_TURN");
    room.hit(current).await.unwrap();

    let view = room.view(None).await.unwrap();
    assert_eq!(view.pile_size, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_join_rejected() {
    let h = harness();
    let (room, _rx1, _rx2) = two_seated(&h, 4).await;
    room.start(1).await.unwrap();

    let (tx, _rx) = mpsc::channel(8);
    let err = room.join(seat(3, "carol"), tx).await.unwrap_err();
    assert_eq!(err.code(), "GAME_ALREADY_STARTED");
    assert!(h.ledger.entries_for(3, EntryReason::Stake).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_seat_without_second_stake() {
    let h = harness();
    let (tx1, _rx1) = mpsc::channel(64);
    let (room, _) = h
        .registry
        .create_room(seat(1, "alice"), tx1, config(4))
        .await
        .unwrap();
    let bob = seat(2, "bob");
    let old_session = bob.session_id;
    let (tx2, _rx2) = mpsc::channel(64);
    room.join(bob, tx2).await.unwrap();
    room.start(1).await.unwrap();

    room.disconnect(old_session).await.unwrap();
    let view = room.view(None).await.unwrap();
    assert!(!view.players.iter().find(|p| p.user_id == 2).unwrap().connected);

    let (tx, mut rx) = mpsc::channel(64);
    let outcome = room.join(seat(2, "bob"), tx).await.unwrap();
    assert!(outcome.reconnected);
    assert_eq!(outcome.balance, None);
    assert_eq!(h.ledger.entries_for(2, EntryReason::Stake).await.len(), 1);

    // The new session receives snapshots.
    wait_for(&mut rx, |e| matches!(e, ServerEvent::GameStateUpdated { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn test_closing_mid_game_settles_on_time() {
    let h = harness();
    let (room, mut rx1, _rx2) = two_seated(&h, 4).await;
    room.start(1).await.unwrap();

    h.registry.close(room.room_id()).await.unwrap();

    let over = wait_for(&mut rx1, |e| matches!(e, ServerEvent::GameOver { .. })).await;
    let ServerEvent::GameOver { winner, reason, .. } = over else {
        unreachable!()
    };
    assert_eq!(reason, EndReason::TimeUp);
    let winner = winner.unwrap();
    assert_eq!(h.ledger.entries_for(winner, EntryReason::Payout).await.len(), 1);
    assert!(h.directory.get(room.room_id()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timer_sync_reports_turn_deadline() {
    let h = harness();
    let (room, _rx1, _rx2) = two_seated(&h, 4).await;

    let waiting = room.sync_timers(Uuid::new_v4()).await.unwrap();
    assert!(waiting.start_deadline.is_some());
    assert!(waiting.turn_deadline.is_none());

    room.start(1).await.unwrap();
    let running = room.sync_timers(Uuid::new_v4()).await.unwrap();
    assert!(running.start_deadline.is_none());
    assert!(running.turn_deadline.is_some());
    assert!(running.round_deadline.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_debug_mode_disabled_by_default() {
    let h = harness();
    let (tx, _rx) = mpsc::channel(64);
    let creator = seat(1, "alice");
    let session = creator.session_id;
    let (room, _) = h
        .registry
        .create_room(creator, tx, config(4))
        .await
        .unwrap();

    let err = room.set_debug_mode(session, true).await.unwrap_err();
    assert_eq!(err.code(), "DEBUG_MODE_DISABLED");
}

/// Two players in a started four-seat room where anyone may ask for cards.
async fn started_vote_room(
    h: &Harness,
) -> (RoomHandle, mpsc::Receiver<ServerEvent>, mpsc::Receiver<ServerEvent>) {
    let (tx1, rx1) = mpsc::channel(1024);
    let (tx2, rx2) = mpsc::channel(1024);
    let room_config = RoomConfig {
        replenish_policy: ReplenishPolicy::AnyActivePlayer,
        ..config(4)
    };
    let (room, _) = h
        .registry
        .create_room(seat(1, "alice"), tx1, room_config)
        .await
        .unwrap();
    room.join(seat(2, "bob"), tx2).await.unwrap();
    room.start(1).await.unwrap();
    (room, rx1, rx2)
}

fn cards_in_play(view: &stake_pile::entities::GameView) -> usize {
    view.players.iter().map(|p| p.hand_size).sum::<usize>() + view.pile_size
}

#[tokio::test(start_paused = true)]
async fn test_approved_vote_replenishes_once() {
    let h = harness();
    let (room, mut rx1, _rx2) = started_vote_room(&h).await;
    assert_eq!(cards_in_play(&room.view(None).await.unwrap()), 52);

    room.request_vote(1).await.unwrap();
    room.submit_vote(2, true).await.unwrap();

    let result = wait_for(&mut rx1, |e| matches!(e, ServerEvent::CardVoteResult(_))).await;
    let ServerEvent::CardVoteResult(result) = result else {
        unreachable!()
    };
    assert!(result.approved);
    assert_eq!(result.requester, 1);
    assert_eq!((result.yes, result.no), (1, 0));

    let entries = h.ledger.entries_for(1, EntryReason::Replenish).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, 50);
    assert!(h.ledger.entries_for(2, EntryReason::Replenish).await.is_empty());
    assert_eq!(h.ledger.get_balance(1, BalanceKind::Main).await.unwrap(), 900);

    let view = room.view(None).await.unwrap();
    assert_eq!(view.card_replenish_count, 1);
    assert_eq!(cards_in_play(&view), 104);
}

#[tokio::test(start_paused = true)]
async fn test_approved_vote_without_funds_changes_nothing() {
    let h = harness();
    let (room, mut rx1, _rx2) = started_vote_room(&h).await;
    h.ledger.set_balance(1, BalanceKind::Main, 10).await;

    room.request_vote(1).await.unwrap();
    room.submit_vote(2, true).await.unwrap();

    let result = wait_for(&mut rx1, |e| matches!(e, ServerEvent::CardVoteResult(_))).await;
    let ServerEvent::CardVoteResult(result) = result else {
        unreachable!()
    };
    assert!(!result.approved);
    assert_eq!(result.requester, 1);

    assert!(h.ledger.entries_for(1, EntryReason::Replenish).await.is_empty());
    assert!(h.ledger.entries_for(1, EntryReason::Refund).await.is_empty());
    assert_eq!(h.ledger.get_balance(1, BalanceKind::Main).await.unwrap(), 10);

    let view = room.view(None).await.unwrap();
    assert_eq!(view.card_replenish_count, 0);
    assert_eq!(cards_in_play(&view), 52);
}

#[tokio::test(start_paused = true)]
async fn test_shuffle_purchase_debits_and_grants() {
    let h = harness();
    let (room, _rx1, _rx2) = started_vote_room(&h).await;

    assert_eq!(room.purchase_shuffle(1).await.unwrap(), 1);

    let entries = h.ledger.entries_for(1, EntryReason::ShufflePurchase).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, 10);
    assert_eq!(h.ledger.get_balance(1, BalanceKind::Main).await.unwrap(), 940);

    let view = room.view(Some(1)).await.unwrap();
    let alice = view.players.iter().find(|p| p.user_id == 1).unwrap();
    assert_eq!(alice.extra_shuffles, 1);
    let bob = view.players.iter().find(|p| p.user_id == 2).unwrap();
    assert_eq!(bob.extra_shuffles, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shuffle_purchase_without_funds_grants_nothing() {
    let h = harness();
    let (room, _rx1, _rx2) = started_vote_room(&h).await;
    h.ledger.set_balance(1, BalanceKind::Main, 5).await;

    let err = room.purchase_shuffle(1).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert!(h.ledger.entries_for(1, EntryReason::ShufflePurchase).await.is_empty());

    let view = room.view(Some(1)).await.unwrap();
    let alice = view.players.iter().find(|p| p.user_id == 1).unwrap();
    assert_eq!(alice.extra_shuffles, 0);
}
