//! PostgreSQL ledger with idempotent debits and credits.
#![allow(clippy::needless_raw_string_hashes)]

use async_trait::async_trait;
use log::debug;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

use super::{
    errors::{WalletError, WalletResult},
    models::{BalanceKind, EntryDirection, EntryReason, Wallet, WalletEntry},
    service::BalanceService,
};
use crate::db::timeouts::{with_default_timeout, with_transaction_timeout};
use crate::game::entities::{Amount, UserId};

/// Wallet manager
#[derive(Clone)]
pub struct WalletManager {
    pool: Arc<PgPool>,
    /// Cap on the total debited per user per UTC day. `None` disables it.
    daily_debit_limit: Option<Amount>,
}

impl WalletManager {
    /// Create a new wallet manager
    ///
    /// `DAILY_DEBIT_LIMIT` (optional) caps what a user can stake per day.
    pub fn new(pool: Arc<PgPool>) -> Self {
        let daily_debit_limit = std::env::var("DAILY_DEBIT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|limit: &Amount| *limit > 0);

        Self {
            pool,
            daily_debit_limit,
        }
    }

    pub fn with_daily_limit(mut self, limit: Option<Amount>) -> Self {
        self.daily_debit_limit = limit;
        self
    }

    /// Get wallet balances for a user
    pub async fn get_wallet(&self, user_id: UserId) -> WalletResult<Wallet> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                SELECT user_id, main_balance, bonus_balance, currency, created_at, updated_at
                FROM wallets
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(self.pool.as_ref()),
        )
        .await?
        .ok_or(WalletError::WalletNotFound(user_id))?;

        Ok(Wallet {
            user_id: row.get("user_id"),
            main_balance: row.get("main_balance"),
            bonus_balance: row.get("bonus_balance"),
            currency: row.get("currency"),
            created_at: row.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
            updated_at: row.get::<chrono::NaiveDateTime, _>("updated_at").and_utc(),
        })
    }

    /// Open a wallet with a starting main balance. No-op if it exists.
    pub async fn ensure_wallet(&self, user_id: UserId, initial_balance: Amount) -> WalletResult<()> {
        with_default_timeout(
            sqlx::query(
                "INSERT INTO wallets (user_id, main_balance, bonus_balance)
                 VALUES ($1, $2, 0)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(initial_balance)
            .execute(self.pool.as_ref()),
        )
        .await?;
        Ok(())
    }

    /// Balance recorded by an earlier call with the same key, if any.
    async fn replayed(
        tx: &mut Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> WalletResult<Option<Amount>> {
        let row = sqlx::query("SELECT balance_after FROM wallet_entries WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|r| r.get("balance_after")))
    }

    async fn debit_tx(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(balance) = Self::replayed(&mut tx, idempotency_key).await? {
            debug!("debit replay for key {idempotency_key}");
            return Ok(balance);
        }

        // Lock the wallet row first so concurrent debits serialize on it.
        let current = sqlx::query(&format!(
            "SELECT {} AS balance FROM wallets WHERE user_id = $1 FOR UPDATE",
            kind.column()
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(WalletError::WalletNotFound(user_id))?;
        let current: Amount = current.get("balance");

        if current < amount {
            return Err(WalletError::InsufficientFunds {
                user_id,
                available: current,
                required: amount,
            });
        }

        if let Some(limit) = self.daily_debit_limit {
            let spent: Amount = sqlx::query(
                "SELECT COALESCE(SUM(-amount), 0)::BIGINT AS spent
                 FROM wallet_entries
                 WHERE user_id = $1 AND direction = 'debit'
                   AND created_at >= date_trunc('day', NOW())",
            )
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?
            .get("spent");
            if spent + amount > limit {
                return Err(WalletError::DailyLimitExceeded { limit });
            }
        }

        let new_balance = current - amount;
        sqlx::query(&format!(
            "UPDATE wallets SET {} = $1, updated_at = NOW() WHERE user_id = $2",
            kind.column()
        ))
        .bind(new_balance)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        Self::create_entry(
            &mut tx,
            user_id,
            kind,
            -amount,
            new_balance,
            EntryDirection::Debit,
            reason,
            idempotency_key,
        )
        .await?;

        tx.commit().await?;
        Ok(new_balance)
    }

    async fn credit_tx(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(balance) = Self::replayed(&mut tx, idempotency_key).await? {
            debug!("credit replay for key {idempotency_key}");
            return Ok(balance);
        }

        let current = sqlx::query(&format!(
            "SELECT {} AS balance FROM wallets WHERE user_id = $1 FOR UPDATE",
            kind.column()
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(WalletError::WalletNotFound(user_id))?;
        let current: Amount = current.get("balance");

        let new_balance = current
            .checked_add(amount)
            .ok_or(WalletError::BalanceOverflow)?;

        sqlx::query(&format!(
            "UPDATE wallets SET {} = $1, updated_at = NOW() WHERE user_id = $2",
            kind.column()
        ))
        .bind(new_balance)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        Self::create_entry(
            &mut tx,
            user_id,
            kind,
            amount,
            new_balance,
            EntryDirection::Credit,
            reason,
            idempotency_key,
        )
        .await?;

        tx.commit().await?;
        Ok(new_balance)
    }

    /// Create a wallet entry (double-entry ledger)
    #[allow(clippy::too_many_arguments)]
    async fn create_entry(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        kind: BalanceKind,
        amount: Amount,
        balance_after: Amount,
        direction: EntryDirection,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallet_entries (user_id, balance_kind, amount, balance_after, direction, reason, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(kind.to_string())
        .bind(amount)
        .bind(balance_after)
        .bind(direction.to_string())
        .bind(reason.to_string())
        .bind(idempotency_key)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("id"))
    }

    /// Get the most recent wallet entries for a user
    pub async fn get_entries(&self, user_id: UserId, limit: i64) -> WalletResult<Vec<WalletEntry>> {
        let rows = with_default_timeout(
            sqlx::query(
                r#"
                SELECT id, user_id, balance_kind, amount, balance_after, direction, reason, idempotency_key, created_at
                FROM wallet_entries
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(user_id)
            .bind(limit)
            .fetch_all(self.pool.as_ref()),
        )
        .await?;

        let entries = rows
            .into_iter()
            .map(|row| WalletEntry {
                id: row.get("id"),
                user_id: row.get("user_id"),
                balance_kind: match row.get::<String, _>("balance_kind").as_str() {
                    "bonus" => BalanceKind::Bonus,
                    _ => BalanceKind::Main,
                },
                amount: row.get("amount"),
                balance_after: row.get("balance_after"),
                direction: match row.get::<String, _>("direction").as_str() {
                    "debit" => EntryDirection::Debit,
                    _ => EntryDirection::Credit,
                },
                reason: EntryReason::parse(row.get::<String, _>("reason").as_str()),
                idempotency_key: row.get("idempotency_key"),
                created_at: row.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
            })
            .collect();

        Ok(entries)
    }
}

#[async_trait]
impl BalanceService for WalletManager {
    async fn get_balance(&self, user_id: UserId, kind: BalanceKind) -> WalletResult<Amount> {
        Ok(self.get_wallet(user_id).await?.balance(kind))
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        with_transaction_timeout(self.debit_tx(user_id, amount, kind, reason, idempotency_key)).await
    }

    async fn credit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount> {
        with_transaction_timeout(self.credit_tx(user_id, amount, kind, reason, idempotency_key)).await
    }
}
