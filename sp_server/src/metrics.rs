//! Prometheus metrics for the stake pile server.
//!
//! Metrics are exposed in Prometheus text format when an exporter address
//! is configured. Without an installed recorder every call is a no-op.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use sp_server::metrics;
//! use std::net::SocketAddr;
//!
//! let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
//! metrics::init_metrics(addr).unwrap();
//!
//! metrics::websocket_connection_opened();
//! metrics::active_rooms(3);
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize Prometheus metrics exporter.
///
/// Metrics will be available at `http://<addr>/metrics`. Must be called
/// from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))
}

// ============================================================================
// WebSocket Metrics
// ============================================================================

pub fn websocket_connection_opened() {
    metrics::counter!("websocket_connections_total").increment(1);
    metrics::gauge!("websocket_connections_active").increment(1.0);
}

pub fn websocket_connection_closed() {
    metrics::gauge!("websocket_connections_active").decrement(1.0);
}

/// Count an inbound frame by event name, or `invalid` when it didn't parse.
pub fn websocket_message_received(event: &'static str) {
    metrics::counter!("websocket_messages_received", "event" => event).increment(1);
}

pub fn websocket_message_sent(event: &'static str) {
    metrics::counter!("websocket_messages_sent", "event" => event).increment(1);
}

// ============================================================================
// Game Metrics
// ============================================================================

/// Set current active rooms count.
pub fn active_rooms(count: usize) {
    metrics::gauge!("active_rooms").set(count as f64);
}

/// A finished game, counted once from the winner's connection.
pub fn game_completed(reason: &str, pool_amount: i64) {
    metrics::counter!("games_completed_total", "reason" => reason.to_string()).increment(1);
    metrics::histogram!("pool_size").record(pool_amount as f64);
}

/// A payout credited to a connected player.
pub fn payout_credited() {
    metrics::counter!("payouts_total").increment(1);
}

// ============================================================================
// Rate Limiting Metrics
// ============================================================================

/// Increment rate limit hits counter.
pub fn rate_limit_hits_total(window: &'static str) {
    metrics::counter!("rate_limit_hits_total", "window" => window).increment(1);
}
