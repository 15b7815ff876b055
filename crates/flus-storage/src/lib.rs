//! Durable state for linked items: the `LinkStore` seam, its Postgres and
//! in-memory implementations, and the credential cipher.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flus_core::{BankAccountRecord, Budget, ItemStatus, LinkedAccount, SealedCredential, SyncedTransaction};
use thiserror::Error;
use uuid::Uuid;

mod cipher;
mod memory;
mod postgres;

pub use cipher::{VaultCipher, VaultError, ENVELOPE_VERSION};
pub use memory::MemoryLinkStore;
pub use postgres::{PgLinkStore, MIGRATION_0001};

pub const CRATE_NAME: &str = "flus-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error while trying to {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("linked account {0} already exists")]
    Conflict(String),
    #[error("linked account {0} not found")]
    NotFound(String),
    #[error("corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("page transaction already finished")]
    TransactionClosed,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn db(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { context, source }
    }
}

/// Persistence for linked items, their bank accounts and synced transactions.
///
/// Everything a sync page writes goes through [`PageTransaction`] so that the
/// transaction upserts, budget increments and the cursor commit together.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn insert_linked_account(&self, account: &LinkedAccount) -> Result<(), StoreError>;

    /// Swaps in a fresh credential after a re-link and re-enables the item.
    async fn replace_credential(
        &self,
        item_id: &str,
        credential: &SealedCredential,
    ) -> Result<(), StoreError>;

    async fn linked_account(&self, item_id: &str) -> Result<Option<LinkedAccount>, StoreError>;

    async fn linked_accounts_for_user(&self, user_id: &str) -> Result<Vec<LinkedAccount>, StoreError>;

    async fn linked_accounts_with_status(
        &self,
        status: ItemStatus,
    ) -> Result<Vec<LinkedAccount>, StoreError>;

    /// Resolves the item that owns `account_id`, restricted to `user_id`.
    async fn item_for_bank_account(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> Result<Option<LinkedAccount>, StoreError>;

    /// Returns `false` when the item does not exist. Never touches the cursor.
    async fn set_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Sets the status only while the item is in one of `from`. Returns
    /// `false` when the item is missing or has moved on.
    async fn transition_status(
        &self,
        item_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn mark_synced(&self, item_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn upsert_bank_accounts(&self, accounts: &[BankAccountRecord]) -> Result<(), StoreError>;

    async fn bank_accounts(&self, item_id: &str) -> Result<Vec<BankAccountRecord>, StoreError>;

    async fn transactions(&self, item_id: &str) -> Result<Vec<SyncedTransaction>, StoreError>;

    async fn budget(&self, budget_id: Uuid) -> Result<Option<Budget>, StoreError>;

    /// Deletes the item together with its bank accounts and transactions.
    async fn delete_linked_account(&self, item_id: &str) -> Result<bool, StoreError>;

    /// Opens the all-or-nothing write unit for one sync page of `item_id`.
    async fn begin_page(&self, item_id: &str) -> Result<Box<dyn PageTransaction>, StoreError>;
}

/// Writes for a single sync page. Dropping it without [`PageTransaction::commit`]
/// discards every write.
#[async_trait]
pub trait PageTransaction: Send {
    /// Subset of `provider_ids` already stored before this page.
    async fn existing_transaction_ids(
        &mut self,
        provider_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// The user's budgets, oldest first.
    async fn budgets_for_user(&mut self, user_id: &str) -> Result<Vec<Budget>, StoreError>;

    /// Insert-or-overwrite keyed by `provider_transaction_id`. An existing row keeps
    /// its surrogate id, creation time and budget link.
    async fn upsert_transaction(&mut self, txn: &SyncedTransaction) -> Result<(), StoreError>;

    async fn delete_transaction(&mut self, provider_transaction_id: &str) -> Result<bool, StoreError>;

    async fn assign_budget(
        &mut self,
        provider_transaction_id: &str,
        budget_id: Uuid,
    ) -> Result<(), StoreError>;

    /// `spent = spent + amount` in the store itself, returning the updated row.
    async fn increment_budget_spent(
        &mut self,
        budget_id: Uuid,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Budget>, StoreError>;

    async fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
