//! Balance ledger used for stakes, refunds, purchases and payouts.
//!
//! This module implements:
//! - The [`BalanceService`] seam rooms talk to
//! - A PostgreSQL double-entry ledger ([`WalletManager`])
//! - An in-memory ledger for tests and local runs ([`MemoryLedger`])
//! - Idempotency keys so retried calls never move money twice
//!
//! ## Example
//!
//! ```no_run
//! use stake_pile::wallet::{BalanceKind, BalanceService, EntryReason, WalletManager};
//! use stake_pile::db::Database;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new(&Default::default()).await?;
//!     let wallet = WalletManager::new(Arc::new(db.pool().clone()));
//!
//!     let balance = wallet
//!         .debit(1, 50, BalanceKind::Main, EntryReason::Stake, "stake_unique_key")
//!         .await?;
//!     println!("Balance after staking: {balance}");
//!     Ok(())
//! }
//! ```

pub mod errors;
pub mod manager;
pub mod memory;
pub mod models;
pub mod service;

pub use errors::{WalletError, WalletResult};
pub use manager::WalletManager;
pub use memory::MemoryLedger;
pub use models::{BalanceKind, EntryDirection, EntryReason, Wallet, WalletEntry};
pub use service::{BalanceService, RetryPolicy, with_retry};
