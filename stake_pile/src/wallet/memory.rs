//! In-process ledger for tests and the server's memory mode.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    errors::{WalletError, WalletResult},
    models::{BalanceKind, EntryDirection, EntryReason, WalletEntry},
    service::BalanceService,
};
use crate::game::entities::{Amount, UserId};

#[derive(Default)]
struct LedgerState {
    balances: HashMap<(UserId, BalanceKind), Amount>,
    /// Balance recorded by the first call with each key.
    applied: HashMap<String, Amount>,
    entries: Vec<WalletEntry>,
    daily_debits: HashMap<UserId, (NaiveDate, Amount)>,
    /// Remaining calls that fail with `Unavailable`.
    outages: u32,
}

/// Ledger kept in memory. Wallets are created on first use when a default
/// balance is set, otherwise unknown users get `WalletNotFound`.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    default_balance: Option<Amount>,
    daily_limit: Option<Amount>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open wallets lazily with this main balance.
    pub fn with_default_balance(mut self, amount: Amount) -> Self {
        self.default_balance = Some(amount);
        self
    }

    pub fn with_daily_limit(mut self, limit: Amount) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub async fn set_balance(&self, user_id: UserId, kind: BalanceKind, amount: Amount) {
        self.state.lock().await.balances.insert((user_id, kind), amount);
    }

    /// Make the next `calls` mutating calls fail with a transient error.
    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.outages = calls;
    }

    pub async fn entries(&self) -> Vec<WalletEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Entries for one user and reason, oldest first.
    pub async fn entries_for(&self, user_id: UserId, reason: EntryReason) -> Vec<WalletEntry> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.reason == reason)
            .cloned()
            .collect()
    }

    async fn apply(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
        direction: EntryDirection,
    ) -> WalletResult<Amount> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }
        let mut state = self.state.lock().await;
        if state.outages > 0 {
            state.outages -= 1;
            return Err(WalletError::Unavailable("ledger outage".to_string()));
        }
        if let Some(balance) = state.applied.get(idempotency_key) {
            return Ok(*balance);
        }

        let current = match state.balances.get(&(user_id, kind)) {
            Some(balance) => *balance,
            None => match (kind, self.default_balance) {
                (BalanceKind::Main, Some(default)) => default,
                (BalanceKind::Bonus, Some(_)) => 0,
                (_, None) => return Err(WalletError::WalletNotFound(user_id)),
            },
        };

        let today = Utc::now().date_naive();
        let new_balance = match direction {
            EntryDirection::Debit => {
                if current < amount {
                    return Err(WalletError::InsufficientFunds {
                        user_id,
                        available: current,
                        required: amount,
                    });
                }
                if let Some(limit) = self.daily_limit {
                    let spent = match state.daily_debits.get(&user_id) {
                        Some((day, spent)) if *day == today => *spent,
                        _ => 0,
                    };
                    if spent + amount > limit {
                        return Err(WalletError::DailyLimitExceeded { limit });
                    }
                    state.daily_debits.insert(user_id, (today, spent + amount));
                }
                current - amount
            }
            EntryDirection::Credit => current
                .checked_add(amount)
                .ok_or(WalletError::BalanceOverflow)?,
        };

        state.balances.insert((user_id, kind), new_balance);
        state.applied.insert(idempotency_key.to_string(), new_balance);
        let id = state.entries.len() as i64 + 1;
        state.entries.push(WalletEntry {
            id,
            user_id,
            balance_kind: kind,
            amount: match direction {
                EntryDirection::Debit => -amount,
                EntryDirection::Credit => amount,
            },
            balance_after: new_balance,
            direction,
            reason,
            idempotency_key: idempotency_key.to_string(),
            created_at: Utc::now(),
        });
        Ok(new_balance)
    }
}

#[async_trait]
impl BalanceService for MemoryLedger {
    async fn get_balance(&self, user_id: UserId, kind: BalanceKind) -> WalletResult<Amount> {
        let state = self.state.lock().await;
        match state.balances.get(&(user_id, kind)) {
            Some(balance) => Ok(*balance),
            None => match (kind, self.default_balance) {
                (BalanceKind::Main, Some(default)) => Ok(default),
                (BalanceKind::Bonus, Some(_)) => Ok(0),
                (_, None) => Err(WalletError::WalletNotFound(user_id)),
            },
        }
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        self.apply(user_id, amount, kind, reason, idempotency_key, EntryDirection::Debit)
            .await
    }

    async fn credit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        self.apply(user_id, amount, kind, reason, idempotency_key, EntryDirection::Credit)
            .await
    }
}
