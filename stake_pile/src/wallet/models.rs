//! Wallet data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::game::entities::{Amount, UserId};

/// Which balance a room stakes from and pays into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceKind {
    #[default]
    Main,
    Bonus,
}

impl BalanceKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "bonus" => BalanceKind::Bonus,
            _ => BalanceKind::Main,
        }
    }

    /// Column holding this balance in the `wallets` table.
    pub const fn column(self) -> &'static str {
        match self {
            BalanceKind::Main => "main_balance",
            BalanceKind::Bonus => "bonus_balance",
        }
    }
}

impl fmt::Display for BalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceKind::Main => write!(f, "main"),
            BalanceKind::Bonus => write!(f, "bonus"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub main_balance: Amount,
    pub bonus_balance: Amount,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn balance(&self, kind: BalanceKind) -> Amount {
        match kind {
            BalanceKind::Main => self.main_balance,
            BalanceKind::Bonus => self.bonus_balance,
        }
    }
}

/// Wallet entry model (double-entry ledger)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: i64,
    pub user_id: UserId,
    pub balance_kind: BalanceKind,
    pub amount: Amount,
    pub balance_after: Amount,
    pub direction: EntryDirection,
    pub reason: EntryReason,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryDirection {
    Debit,
    Credit,
}

impl fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryDirection::Debit => write!(f, "debit"),
            EntryDirection::Credit => write!(f, "credit"),
        }
    }
}

/// Why money moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Joining a room.
    Stake,
    /// Stake returned when leaving before the start or on dissolution.
    Refund,
    /// Pool paid to the winner.
    Payout,
    /// Stake for an approved card replenishment.
    Replenish,
    ShufflePurchase,
    Adjustment,
}

impl EntryReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "stake" => EntryReason::Stake,
            "refund" => EntryReason::Refund,
            "payout" => EntryReason::Payout,
            "replenish" => EntryReason::Replenish,
            "shuffle_purchase" => EntryReason::ShufflePurchase,
            _ => EntryReason::Adjustment,
        }
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryReason::Stake => write!(f, "stake"),
            EntryReason::Refund => write!(f, "refund"),
            EntryReason::Payout => write!(f, "payout"),
            EntryReason::Replenish => write!(f, "replenish"),
            EntryReason::ShufflePurchase => write!(f, "shuffle_purchase"),
            EntryReason::Adjustment => write!(f, "adjustment"),
        }
    }
}
