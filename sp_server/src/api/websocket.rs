//! WebSocket transport for the event protocol.
//!
//! # Connection Flow
//!
//! 1. Client connects via `GET /ws?user_id=<id>&username=<name>`
//! 2. The server opens a [`Session`] with its own outbound channel
//! 3. A send task serializes everything on that channel to text frames.
//!    Room broadcasts and replies share it, so ordering is preserved
//! 4. Incoming text frames are throttled, parsed as [`ClientEvent`] and
//!    handed to the gateway
//! 5. On close the seat is kept; the room marks the player disconnected
//!
//! # Example
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:6969/ws?user_id=7&username=alice');
//!
//! ws.onmessage = (frame) => {
//!   const { event, data } = JSON.parse(frame.data);
//!   if (event === 'game_state_updated') render(data.state);
//! };
//!
//! ws.send(JSON.stringify({ event: 'join_room', data: { code: 'K7QX2M' } }));
//! ws.send(JSON.stringify({ event: 'play_card', data: { card: { id: 12 } } }));
//! ```

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use stake_pile::{
    ClientEvent, ServerEvent, Session,
    constants::MAX_USERNAME_LENGTH,
    entities::{UserId, Username},
    wallet::EntryReason,
};
use std::time::Instant;
use tokio::sync::mpsc;

use super::{AppState, rate_limiter::ConnectionLimiter};
use crate::{logging, metrics};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: UserId,
    pub username: String,
}

impl WsQuery {
    /// The identity the upstream proxy vouched for.
    pub fn identity(&self) -> Result<(UserId, Username), &'static str> {
        if self.user_id <= 0 {
            return Err("user_id must be positive");
        }
        let username = self.username.trim();
        if username.is_empty() {
            return Err("username must not be empty");
        }
        if username.chars().count() > MAX_USERNAME_LENGTH {
            return Err("username is too long");
        }
        Ok((self.user_id, Username::new(username)))
    }
}

/// Upgrade to a WebSocket carrying the event protocol.
///
/// Returns `401 Unauthorized` when the query doesn't name a usable identity.
/// With a PostgreSQL ledger the user's wallet is opened here on first connect.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let (user_id, username) = match query.identity() {
        Ok(identity) => identity,
        Err(reason) => return (StatusCode::UNAUTHORIZED, reason).into_response(),
    };

    if let Some((wallets, starting_balance)) = &state.wallets {
        if let Err(e) = wallets.ensure_wallet(user_id, *starting_balance).await {
            error!("Failed to open wallet for user {}: {}", user_id, e);
            return (StatusCode::SERVICE_UNAVAILABLE, "wallet unavailable").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, username, state))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, username: Username, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerEvent>(state.connection.outbound_capacity);

    let mut session = Session::new(user_id, username, outbound_tx.clone());
    let session_id = session.session_id.to_string();
    logging::log_connection("open", user_id, &session_id);
    metrics::websocket_connection_opened();

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            record_outbound(user_id, &event);
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize {} event: {}", event.name(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut limiter = ConnectionLimiter::new(&state.connection);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(window) = limiter.check() {
                    logging::log_rate_limited(user_id, window.as_str());
                    metrics::rate_limit_hits_total(window.as_str());
                    let _ = outbound_tx
                        .send(ServerEvent::error("RATE_LIMITED", window.message()))
                        .await;
                    continue;
                }

                let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Unparseable frame from user {}: {}", user_id, e);
                        metrics::websocket_message_received("invalid");
                        let _ = outbound_tx
                            .send(ServerEvent::error("INVALID_MESSAGE", "Invalid message format"))
                            .await;
                        continue;
                    }
                };

                let name = event.name();
                metrics::websocket_message_received(name);
                let started = Instant::now();
                state.gateway.dispatch(&mut session, event).await;
                logging::log_slow_dispatch(name, started.elapsed().as_millis() as u64);
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by user {}", user_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
            _ => {}
        }
    }

    state.gateway.disconnect(&mut session).await;
    // Rooms may still hold a clone of the outbound sender, so the send task
    // won't end on its own.
    send_task.abort();

    metrics::websocket_connection_closed();
    logging::log_connection("close", user_id, &session_id);
}

fn record_outbound(user_id: UserId, event: &ServerEvent) {
    metrics::websocket_message_sent(event.name());
    match event {
        ServerEvent::GameOver {
            winner: Some(winner),
            reason,
            pool_amount,
        } if *winner == user_id => {
            metrics::game_completed(&reason.to_string(), *pool_amount);
        }
        ServerEvent::BalanceUpdate {
            reason: EntryReason::Payout,
            ..
        } => metrics::payout_credited(),
        _ => {}
    }
}
