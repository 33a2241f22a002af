//! Database configuration module.

use std::env;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,

    /// Maximum connection lifetime in seconds
    pub max_lifetime_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| format!("{key} has an invalid value: {value}")),
        Err(_) => Ok(default),
    }
}

impl DatabaseConfig {
    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 20)
    /// - `DB_MIN_CONNECTIONS`: Minimum pool size (default: 5)
    /// - `DB_CONNECTION_TIMEOUT`: Connection timeout in seconds (default: 10)
    /// - `DB_IDLE_TIMEOUT`: Idle timeout in seconds (default: 600)
    /// - `DB_MAX_LIFETIME`: Max lifetime in seconds (default: 1800)
    ///
    /// Returns an error naming the offending variable if one is missing or
    /// malformed.
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;
        Ok(Self {
            database_url,
            max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout_secs: env_or("DB_CONNECTION_TIMEOUT", 10)?,
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT", 600)?,
            max_lifetime_secs: env_or("DB_MAX_LIFETIME", 1800)?,
        })
    }

    /// Create a default configuration for development
    ///
    /// Uses `postgres://postgres@localhost/stake_pile` as the database URL
    pub fn development() -> Self {
        Self {
            database_url: "postgres://postgres@localhost/stake_pile".to_string(),
            max_connections: 20,
            min_connections: 5,
            connection_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 20);
        assert!(config.database_url.starts_with("postgres://"));
    }
}
