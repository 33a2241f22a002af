//! Stake pile game server.
//!
//! Hosts room actors behind a RoomRegistry and speaks the JSON event
//! protocol over WebSockets. Balances live in memory for development or
//! in PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use ctrlc::set_handler;
use log::{info, warn};
use pico_args::Arguments;
use sp_server::{
    api,
    config::{LedgerKind, ServerConfig},
    logging, metrics,
};
use stake_pile::{
    Gateway,
    db::{Database, MemoryRoomDirectory, PgRoomDirectory, RoomDirectory},
    room::RoomRegistry,
    wallet::{BalanceService, MemoryLedger, WalletManager},
};
use tokio::sync::watch;

const HELP: &str = "\
Run the stake pile game server

USAGE:
  sp_server [OPTIONS]

OPTIONS:
  --bind          IP:PORT  Server socket bind address  [default: env SERVER_BIND or 127.0.0.1:6969]
  --ledger        KIND     memory or postgres          [default: env LEDGER or memory]
  --db-url        URL      Database connection string  [default: env DATABASE_URL]
  --metrics-bind  IP:PORT  Prometheus scrape address   [default: env METRICS_BIND, off when unset]

FLAGS:
  -h, --help               Print help information

ENVIRONMENT:
  SERVER_BIND              Server bind address (e.g., 0.0.0.0:8080)
  DATABASE_URL             PostgreSQL connection string
  STARTING_BALANCE         Balance of new users
  ROOM_STAKE_AMOUNT        Stake for rooms created without a config
  ROOM_TURN_DURATION_SECS  Turn length for rooms created without a config
  SHUFFLE_PRICE            Price of an extra shuffle
  (See sp_server/.env.example for all configuration options)
";

/// How often the active room gauge is refreshed.
const ROOM_GAUGE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let bind = pargs.opt_value_from_str("--bind")?;
    let ledger: Option<LedgerKind> = pargs.opt_value_from_str("--ledger")?;
    let database_url: Option<String> = pargs.opt_value_from_str("--db-url")?;
    let metrics_bind = pargs.opt_value_from_str("--metrics-bind")?;

    logging::init();

    let mut config = ServerConfig::from_env(bind, database_url, ledger)?;
    if metrics_bind.is_some() {
        config.metrics_bind = metrics_bind;
    }
    config.validate()?;

    // Catching signals for exit.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    if let Some(addr) = config.metrics_bind {
        metrics::init_metrics(addr).map_err(Error::msg)?;
        info!("Prometheus metrics at http://{}/metrics", addr);
    }

    let (balance, directory, database, wallets): (
        Arc<dyn BalanceService>,
        Arc<dyn RoomDirectory>,
        Option<Database>,
        Option<WalletManager>,
    ) = match config.ledger {
        LedgerKind::Memory => {
            warn!("Using the in-memory ledger; balances are lost on restart");
            (
                Arc::new(MemoryLedger::new().with_default_balance(config.starting_balance)),
                Arc::new(MemoryRoomDirectory::new()),
                None,
                None,
            )
        }
        LedgerKind::Postgres => {
            info!("Connecting to database");
            let db = Database::new(&config.database)
                .await
                .context("Failed to connect to database")?;
            db.migrate().await.context("Failed to apply schema")?;
            info!("Database connected successfully");
            let wallets = WalletManager::new(Arc::new(db.pool().clone()));
            (
                Arc::new(wallets.clone()),
                Arc::new(PgRoomDirectory::new(db.pool().clone())),
                Some(db),
                Some(wallets),
            )
        }
    };

    let registry = RoomRegistry::new(balance, directory, config.engine.clone());
    let gateway = Gateway::new(registry.clone()).with_room_defaults(config.room_defaults.clone());

    let mut state = api::AppState::new(gateway, config.connection.clone());
    if let Some(db) = database.clone() {
        state = state.with_database(db);
    }
    if let Some(wallets) = wallets {
        state = state.with_wallets(wallets, config.starting_balance);
    }
    let app = api::create_router(state);

    let gauge_registry = registry.clone();
    let room_gauge = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ROOM_GAUGE_INTERVAL);
        loop {
            ticker.tick().await;
            metrics::active_rooms(gauge_registry.active_room_count().await);
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    info!(
        "Server is running at http://{}. Press Ctrl+C to stop.",
        config.bind
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
        .context("Server error")?;

    info!("Shutting down server...");
    room_gauge.abort();
    registry.shutdown().await;
    if let Some(db) = database {
        db.close().await;
    }

    Ok(())
}
