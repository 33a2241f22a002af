use chrono::Utc;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::{SeedableRng, rngs::StdRng};
use stake_pile::{
    GameSettings, GameState, RoomStatus,
    entities::{Deck, Username},
};
use uuid::Uuid;

/// A waiting room with N seated players.
fn seated(n_players: usize, seed: u64) -> GameState {
    let settings = GameSettings {
        capacity: n_players.max(2),
        ..GameSettings::default()
    };
    let mut game = GameState::with_seed(settings, seed);
    let now = Utc::now();
    for i in 0..n_players {
        let username = Username::new(&format!("player{i}"));
        game.add_player(i as i64 + 1, Uuid::new_v4(), username, now)
            .unwrap();
    }
    game
}

fn started(n_players: usize, seed: u64) -> GameState {
    let mut game = seated(n_players, seed);
    game.start_game(Utc::now()).unwrap();
    game.drain_events();
    game
}

fn bench_deck_shuffle(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    c.bench_function("deck_shuffle", |b| {
        b.iter(|| Deck::shuffled(0, &mut rng));
    });
}

/// Shuffle plus round-robin deal for each table size
fn bench_start_game(c: &mut Criterion) {
    let mut group = c.benchmark_group("start_game");

    for n_players in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{n_players}_players")),
            n_players,
            |b, &n| {
                b.iter_batched(
                    || seated(n, 11),
                    |mut game| {
                        game.start_game(Utc::now()).unwrap();
                        game
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Every player hits until the game ends or the play cap is reached.
fn bench_hit_until_done(c: &mut Criterion) {
    let mut group = c.benchmark_group("hit_until_done");

    for n_players in [2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{n_players}_players")),
            n_players,
            |b, &n| {
                b.iter_batched(
                    || started(n, 23),
                    |mut game| {
                        let now = Utc::now();
                        for _ in 0..2_000 {
                            let Some(current) = game.current_player().map(|p| p.user_id) else {
                                break;
                            };
                            let play = game.hit(current, now).unwrap();
                            if let Some(terminal) = play.terminal {
                                game.complete(terminal, now).unwrap();
                                break;
                            }
                        }
                        game
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Per-viewer snapshots, as broadcast after every mutation
fn bench_view_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_generation");

    for n_players in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{n_players}_players")),
            n_players,
            |b, &n| {
                let game = started(n, 5);
                assert_eq!(game.status(), RoomStatus::InProgress);
                b.iter(|| {
                    (1..=n as i64)
                        .map(|viewer| game.view_for(Some(viewer), false))
                        .collect::<Vec<_>>()
                });
            },
        );
    }

    group.finish();
}

fn bench_drain_events(c: &mut Criterion) {
    c.bench_function("drain_events", |b| {
        b.iter_batched(
            || {
                let mut game = seated(4, 3);
                game.start_game(Utc::now()).unwrap();
                game
            },
            |mut g| {
                g.drain_events();
                g
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(deck_operations, bench_deck_shuffle, bench_start_game);

criterion_group!(
    game_operations,
    bench_hit_until_done,
    bench_view_generation,
    bench_drain_events,
);

criterion_main!(deck_operations, game_operations);
