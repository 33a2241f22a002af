//! Server configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use stake_pile::{
    db::DatabaseConfig,
    entities::Amount,
    game::ReplenishPolicy,
    room::{EngineSettings, RoomConfig, Visibility},
    wallet::BalanceKind,
};
use std::{net::SocketAddr, str::FromStr};

/// Where balances live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    /// In-process ledger. Balances are lost on restart.
    Memory,
    /// PostgreSQL wallet tables.
    Postgres,
}

impl FromStr for LedgerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(LedgerKind::Memory),
            "postgres" | "pg" => Ok(LedgerKind::Postgres),
            other => Err(ConfigError::Invalid {
                var: "LEDGER".to_string(),
                reason: format!("Unknown ledger '{other}', expected memory or postgres"),
            }),
        }
    }
}

/// Complete server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind: SocketAddr,
    /// Prometheus scrape address; the exporter is off when unset
    pub metrics_bind: Option<SocketAddr>,
    pub ledger: LedgerKind,
    /// Database configuration, used by the postgres ledger
    pub database: DatabaseConfig,
    /// Balance a wallet opens with on first connect
    pub starting_balance: Amount,
    /// Config for rooms created without one
    pub room_defaults: RoomConfig,
    pub engine: EngineSettings,
    pub connection: ConnectionConfig,
}

/// Per-connection limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Events buffered for a slow client before rooms start dropping them
    pub outbound_capacity: usize,
    /// Messages allowed per second
    pub burst_limit: usize,
    /// Messages allowed per minute
    pub sustained_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            burst_limit: 10,
            sustained_limit: 100,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// CLI overrides win over the environment, which wins over defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but cannot be used
    pub fn from_env(
        bind_override: Option<SocketAddr>,
        database_url_override: Option<String>,
        ledger_override: Option<LedgerKind>,
    ) -> Result<Self, ConfigError> {
        let bind = match bind_override {
            Some(bind) => bind,
            None => parse_env_required_format("SERVER_BIND")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 6969))),
        };

        let metrics_bind = parse_env_required_format("METRICS_BIND")?;

        let ledger = match ledger_override {
            Some(ledger) => ledger,
            None => match std::env::var("LEDGER") {
                Ok(value) => value.parse()?,
                Err(_) => LedgerKind::Memory,
            },
        };

        let database_url = database_url_override
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| DatabaseConfig::development().database_url);

        let database = DatabaseConfig {
            database_url,
            max_connections: parse_env_or("DB_MAX_CONNECTIONS", 20),
            min_connections: parse_env_or("DB_MIN_CONNECTIONS", 2),
            connection_timeout_secs: parse_env_or("DB_CONNECTION_TIMEOUT_SECS", 5),
            idle_timeout_secs: parse_env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: parse_env_or("DB_MAX_LIFETIME_SECS", 1800),
        };

        let base = RoomConfig::default();
        let replenish_policy = match std::env::var("ROOM_REPLENISH_POLICY")
            .ok()
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None => base.replenish_policy,
            Some("empty_hand_only") => ReplenishPolicy::EmptyHandOnly,
            Some("any_active_player") => ReplenishPolicy::AnyActivePlayer,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "ROOM_REPLENISH_POLICY".to_string(),
                    reason: format!(
                        "Unknown policy '{other}', expected empty_hand_only or any_active_player"
                    ),
                });
            }
        };
        let balance_kind = match std::env::var("ROOM_BALANCE_KIND") {
            Ok(kind) => BalanceKind::parse(&kind.to_ascii_lowercase()),
            Err(_) => base.balance_kind,
        };

        let room_defaults = RoomConfig {
            visibility: std::env::var("ROOM_VISIBILITY")
                .map(|v| Visibility::parse(&v.to_ascii_lowercase()))
                .unwrap_or(base.visibility),
            capacity: parse_env_or("ROOM_CAPACITY", base.capacity),
            stake_amount: parse_env_or("ROOM_STAKE_AMOUNT", base.stake_amount),
            turn_duration: parse_env_or("ROOM_TURN_DURATION_SECS", base.turn_duration),
            round_duration: parse_env_or("ROOM_ROUND_DURATION_SECS", base.round_duration),
            shuffle_limit: parse_env_or("ROOM_SHUFFLE_LIMIT", base.shuffle_limit),
            ready_grace: parse_env_or("ROOM_READY_GRACE_SECS", base.ready_grace),
            waiting_timeout: parse_env_or("ROOM_WAITING_TIMEOUT_SECS", base.waiting_timeout),
            match_settle_ms: parse_env_or("ROOM_MATCH_SETTLE_MS", base.match_settle_ms),
            vote_window: parse_env_or("ROOM_VOTE_WINDOW_SECS", base.vote_window),
            auto_play_limit: parse_env_or("ROOM_AUTO_PLAY_LIMIT", base.auto_play_limit),
            replenish_policy,
            balance_kind,
            cleanup_delay: parse_env_or("ROOM_CLEANUP_DELAY_SECS", base.cleanup_delay),
        };

        let engine_base = EngineSettings::default();
        let engine = EngineSettings {
            shuffle_price: parse_env_or("SHUFFLE_PRICE", engine_base.shuffle_price),
            allow_debug_mode: parse_env_or("ALLOW_DEBUG_MODE", engine_base.allow_debug_mode),
            inbox_capacity: parse_env_or("ROOM_INBOX_CAPACITY", engine_base.inbox_capacity),
        };

        let connection_base = ConnectionConfig::default();
        let connection = ConnectionConfig {
            outbound_capacity: parse_env_or("WS_OUTBOUND_CAPACITY", connection_base.outbound_capacity),
            burst_limit: parse_env_or("WS_BURST_LIMIT", connection_base.burst_limit),
            sustained_limit: parse_env_or("WS_SUSTAINED_LIMIT", connection_base.sustained_limit),
        };

        Ok(ServerConfig {
            bind,
            metrics_bind,
            ledger,
            database,
            starting_balance: parse_env_or("STARTING_BALANCE", 1_000),
            room_defaults,
            engine,
            connection,
        })
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.room_defaults
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                var: "ROOM_*".to_string(),
                reason,
            })?;

        if self.engine.shuffle_price <= 0 {
            return Err(ConfigError::Invalid {
                var: "SHUFFLE_PRICE".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.engine.inbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOM_INBOX_CAPACITY".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.starting_balance < 0 {
            return Err(ConfigError::Invalid {
                var: "STARTING_BALANCE".to_string(),
                reason: "Must not be negative".to_string(),
            });
        }

        if self.connection.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_OUTBOUND_CAPACITY".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.connection.burst_limit == 0 || self.connection.sustained_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_BURST_LIMIT".to_string(),
                reason: "Rate limits must be greater than 0".to_string(),
            });
        }

        if self.connection.sustained_limit < self.connection.burst_limit {
            return Err(ConfigError::Invalid {
                var: "WS_SUSTAINED_LIMIT".to_string(),
                reason: format!(
                    "Must be at least the burst limit ({})",
                    self.connection.burst_limit
                ),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Helper to parse environment variable with default fallback
fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`parse_env_or`], but a value that is set and malformed is an error.
fn parse_env_required_format<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(value) => value.parse().map(Some).map_err(|_| ConfigError::Invalid {
            var: key.to_string(),
            reason: format!("Cannot parse '{value}'"),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:8080".parse().unwrap(),
            metrics_bind: None,
            ledger: LedgerKind::Memory,
            database: DatabaseConfig::development(),
            starting_balance: 1_000,
            room_defaults: RoomConfig::default(),
            engine: EngineSettings::default(),
            connection: ConnectionConfig::default(),
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingRequired {
            var: "DATABASE_URL".to_string(),
            hint: "Use --ledger memory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("DATABASE_URL"));
        assert!(msg.contains("Use --ledger memory"));
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_room_defaults_rejected() {
        let mut config = config();
        config.room_defaults.capacity = 12;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("Capacity"));
    }

    #[test]
    fn test_zero_shuffle_price_rejected() {
        let mut config = config();
        config.engine.shuffle_price = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { var, .. }) if var == "SHUFFLE_PRICE"
        ));
    }

    #[test]
    fn test_sustained_below_burst_rejected() {
        let mut config = config();
        config.connection.sustained_limit = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ledger_kind_parse() {
        assert_eq!("memory".parse::<LedgerKind>().unwrap(), LedgerKind::Memory);
        assert_eq!("Postgres".parse::<LedgerKind>().unwrap(), LedgerKind::Postgres);
        assert!("redis".parse::<LedgerKind>().is_err());
    }
}
