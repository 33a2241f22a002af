//! Wallet error types.

use thiserror::Error;

use crate::db::timeouts::TimeoutError;
use crate::game::entities::{Amount, UserId};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Insufficient funds for user {user_id}: available {available}, required {required}")]
    InsufficientFunds {
        user_id: UserId,
        available: Amount,
        required: Amount,
    },

    #[error("Daily debit limit of {limit} exceeded")]
    DailyLimitExceeded { limit: Amount },

    #[error("Wallet not found for user {0}")]
    WalletNotFound(UserId),

    /// Amounts must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(Amount),

    #[error("Balance overflow")]
    BalanceOverflow,

    /// Ledger backend can't be reached right now
    #[error("Balance service unavailable: {0}")]
    Unavailable(String),

    #[error("Balance operation timed out")]
    Timeout,
}

impl WalletError {
    /// Whether repeating the same idempotent call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WalletError::Unavailable(_) | WalletError::Timeout => true,
            WalletError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::DailyLimitExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
            WalletError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            WalletError::InvalidAmount(_) => "INVALID_AMOUNT",
            WalletError::BalanceOverflow => "BALANCE_OVERFLOW",
            WalletError::Database(_) | WalletError::Unavailable(_) | WalletError::Timeout => {
                "BALANCE_UNAVAILABLE"
            }
        }
    }

    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Database errors are sanitized and user IDs are redacted.
    pub fn client_message(&self) -> String {
        match self {
            WalletError::Database(_) | WalletError::Unavailable(_) | WalletError::Timeout => {
                "Balance service unavailable, try again".to_string()
            }
            WalletError::WalletNotFound(_) => "Wallet not found".to_string(),
            WalletError::InsufficientFunds {
                available, required, ..
            } => format!("Insufficient funds: available {available}, required {required}"),
            _ => self.to_string(),
        }
    }
}

impl From<TimeoutError> for WalletError {
    fn from(e: TimeoutError) -> Self {
        match e {
            TimeoutError::Timeout(_) => WalletError::Timeout,
            TimeoutError::Database(e) => WalletError::Database(e),
        }
    }
}

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_redacts_user() {
        let err = WalletError::InsufficientFunds {
            user_id: 42,
            available: 10,
            required: 50,
        };
        assert!(!err.client_message().contains("42"));
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }

    #[test]
    fn test_transient_classification() {
        assert!(WalletError::Timeout.is_transient());
        assert!(WalletError::Unavailable("down".into()).is_transient());
        assert!(WalletError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!WalletError::InvalidAmount(0).is_transient());
        assert!(!WalletError::WalletNotFound(1).is_transient());
    }
}
