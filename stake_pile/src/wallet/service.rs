//! Balance service seam used by rooms.
//!
//! Rooms never touch the database directly. Every debit and credit carries an
//! idempotency key, so a call that timed out can be repeated safely and a
//! replay returns the balance recorded by the first attempt.

use async_trait::async_trait;
use log::warn;
use rand::Rng;
use std::{future::Future, time::Duration};

use super::{
    errors::WalletResult,
    models::{BalanceKind, EntryReason},
};
use crate::game::entities::{Amount, UserId};

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn get_balance(&self, user_id: UserId, kind: BalanceKind) -> WalletResult<Amount>;

    /// Take `amount` from the user. Returns the new balance.
    async fn debit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount>;

    /// Give `amount` to the user. Returns the new balance.
    async fn credit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: BalanceKind,
        reason: EntryReason,
        idempotency_key: &str,
    ) -> WalletResult<Amount>;
}

/// Bounded exponential backoff for idempotent balance calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// "Equal jitter": delay is in `[backoff/2, backoff]`.
fn jittered(backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let half_ms = backoff_ms / 2;
    let jitter_ms = rand::rng().random_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
/// Only use this for calls keyed by an idempotency key.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> WalletResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WalletResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = jittered(policy.backoff(attempt));
                warn!(
                    "{label}: attempt {attempt}/{} failed ({e}), retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
