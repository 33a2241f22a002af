//! Structured logging setup.
//!
//! The engine logs through the `log` facade; `tracing-subscriber` picks
//! those records up alongside the server's own `tracing` events.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn";

/// Initialize structured logging
///
/// Log levels follow the `RUST_LOG` env var, falling back to
/// [`DEFAULT_FILTER`].
///
/// # Example
///
/// ```no_run
/// use sp_server::logging;
///
/// #[tokio::main]
/// async fn main() {
///     logging::init();
///     tracing::info!("Server starting");
/// }
/// ```
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Log a client connecting or leaving.
pub fn log_connection(event_type: &str, user_id: i64, session_id: &str) {
    tracing::info!(
        event_type = event_type,
        user_id = user_id,
        session_id = session_id,
        "Connection {}",
        event_type
    );
}

/// Log a client that was throttled.
pub fn log_rate_limited(user_id: i64, window: &str) {
    tracing::warn!(
        user_id = user_id,
        window = window,
        "RATE LIMIT: message dropped"
    );
}

/// Log a frame that took long to handle.
pub fn log_slow_dispatch(event: &str, duration_ms: u64) {
    if duration_ms > 1000 {
        tracing::warn!(
            event = event,
            duration_ms = duration_ms,
            "PERFORMANCE: Slow dispatch"
        );
    } else {
        tracing::debug!(event = event, duration_ms = duration_ms, "Dispatch timing");
    }
}
