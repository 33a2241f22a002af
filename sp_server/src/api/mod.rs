//! HTTP/WebSocket surface of the server.
//!
//! Only two routes exist. Everything game related travels over the
//! WebSocket as JSON events and is handled by the engine's gateway.
//!
//! # Endpoints
//!
//! ```text
//! GET /health                                 - Server health status
//! GET /ws?user_id=<id>&username=<name>        - WebSocket event stream
//! ```
//!
//! Identity comes from the query string. Authentication is expected to
//! happen upstream, in front of this server.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use sp_server::{api::{create_router, AppState}, config::ConnectionConfig};
//! use stake_pile::{
//!     db::MemoryRoomDirectory,
//!     room::{EngineSettings, RoomRegistry},
//!     Gateway, MemoryLedger,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RoomRegistry::new(
//!     Arc::new(MemoryLedger::new().with_default_balance(1_000)),
//!     Arc::new(MemoryRoomDirectory::new()),
//!     EngineSettings::default(),
//! );
//! let state = AppState::new(Gateway::new(registry), ConnectionConfig::default());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, create_router(state)).await?;
//! # Ok(())
//! # }
//! ```

pub mod rate_limiter;
pub mod websocket;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde_json::json;
use stake_pile::{Gateway, db::Database, entities::Amount, wallet::WalletManager};
use tower_http::cors::CorsLayer;

use crate::config::ConnectionConfig;

/// Application state shared by every request and connection.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// Present when balances live in PostgreSQL.
    pub database: Option<Database>,
    /// Wallets opened on first connect, with this starting balance.
    pub wallets: Option<(WalletManager, Amount)>,
    pub connection: ConnectionConfig,
}

impl AppState {
    pub fn new(gateway: Gateway, connection: ConnectionConfig) -> Self {
        Self {
            gateway,
            database: None,
            wallets: None,
            connection,
        }
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_wallets(mut self, wallets: WalletManager, starting_balance: Amount) -> Self {
        self.wallets = Some((wallets, starting_balance));
        self
    }
}

/// Build the router with CORS applied to all routes.
///
/// CORS is permissive; restrict origins at the proxy in production.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint for monitoring and load balancers.
///
/// Returns `200 OK` when the ledger database (if any) answers, `503` otherwise.
///
/// ```bash
/// curl http://localhost:6969/health
/// # {"status":"healthy","database":null,"rooms":{"active_count":2},...}
/// ```
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_healthy = match &state.database {
        Some(db) => Some(db.health_check().await.is_ok()),
        None => None,
    };

    let active_rooms = state.gateway.registry().active_room_count().await;
    let healthy = db_healthy.unwrap_or(true);

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": db_healthy,
        "rooms": {
            "active_count": active_rooms
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (status_code, Json(response))
}
