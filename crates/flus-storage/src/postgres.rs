use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use flus_core::{
    BankAccountRecord, Budget, ItemStatus, LinkedAccount, SealedCredential, SyncedTransaction,
    TransactionKind,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{LinkStore, PageTransaction, StoreError};

pub const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");

const LINKED_COLUMNS: &str = "item_id, user_id, institution_id, institution_name, credential, \
     status, error_code, cursor, last_synced_at, created_at, updated_at";

const BANK_COLUMNS: &str = "item_id, account_id, name, official_name, account_type, subtype, mask, \
     current_balance, available_balance, iso_currency_code, created_at, updated_at";

const TXN_COLUMNS: &str = "id, item_id, account_id, provider_transaction_id, amount, \
     iso_currency_code, name, merchant_name, raw_category, category, kind, txn_date, pending, \
     budget_id, created_at, updated_at";

const BUDGET_COLUMNS: &str = "id, user_id, name, category, amount, spent, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(StoreError::db("connect postgres"))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("apply migrations"))?;
        info!("storage schema applied");
        Ok(())
    }
}

fn linked_from_row(row: &PgRow) -> Result<LinkedAccount, StoreError> {
    let status_raw: String = row.try_get("status").map_err(StoreError::db("status"))?;
    let status = ItemStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
        table: "linked_accounts",
        message: format!("unknown status {status_raw}"),
    })?;
    let credential: String = row.try_get("credential").map_err(StoreError::db("credential"))?;
    Ok(LinkedAccount {
        item_id: row.try_get("item_id").map_err(StoreError::db("item_id"))?,
        user_id: row.try_get("user_id").map_err(StoreError::db("user_id"))?,
        institution_id: row
            .try_get("institution_id")
            .map_err(StoreError::db("institution_id"))?,
        institution_name: row
            .try_get("institution_name")
            .map_err(StoreError::db("institution_name"))?,
        credential: SealedCredential::from_envelope(credential),
        status,
        error_code: row.try_get("error_code").map_err(StoreError::db("error_code"))?,
        cursor: row.try_get("cursor").map_err(StoreError::db("cursor"))?,
        last_synced_at: row
            .try_get("last_synced_at")
            .map_err(StoreError::db("last_synced_at"))?,
        created_at: row.try_get("created_at").map_err(StoreError::db("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(StoreError::db("updated_at"))?,
    })
}

fn bank_from_row(row: &PgRow) -> Result<BankAccountRecord, StoreError> {
    Ok(BankAccountRecord {
        item_id: row.try_get("item_id").map_err(StoreError::db("item_id"))?,
        account_id: row.try_get("account_id").map_err(StoreError::db("account_id"))?,
        name: row.try_get("name").map_err(StoreError::db("name"))?,
        official_name: row
            .try_get("official_name")
            .map_err(StoreError::db("official_name"))?,
        account_type: row
            .try_get("account_type")
            .map_err(StoreError::db("account_type"))?,
        subtype: row.try_get("subtype").map_err(StoreError::db("subtype"))?,
        mask: row.try_get("mask").map_err(StoreError::db("mask"))?,
        current_balance: row
            .try_get("current_balance")
            .map_err(StoreError::db("current_balance"))?,
        available_balance: row
            .try_get("available_balance")
            .map_err(StoreError::db("available_balance"))?,
        iso_currency_code: row
            .try_get("iso_currency_code")
            .map_err(StoreError::db("iso_currency_code"))?,
        created_at: row.try_get("created_at").map_err(StoreError::db("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(StoreError::db("updated_at"))?,
    })
}

fn txn_from_row(row: &PgRow) -> Result<SyncedTransaction, StoreError> {
    let kind_raw: String = row.try_get("kind").map_err(StoreError::db("kind"))?;
    let kind = TransactionKind::parse(&kind_raw).ok_or_else(|| StoreError::Corrupt {
        table: "synced_transactions",
        message: format!("unknown kind {kind_raw}"),
    })?;
    let date: NaiveDate = row.try_get("txn_date").map_err(StoreError::db("txn_date"))?;
    Ok(SyncedTransaction {
        id: row.try_get("id").map_err(StoreError::db("id"))?,
        item_id: row.try_get("item_id").map_err(StoreError::db("item_id"))?,
        account_id: row.try_get("account_id").map_err(StoreError::db("account_id"))?,
        provider_transaction_id: row
            .try_get("provider_transaction_id")
            .map_err(StoreError::db("provider_transaction_id"))?,
        amount: row.try_get("amount").map_err(StoreError::db("amount"))?,
        iso_currency_code: row
            .try_get("iso_currency_code")
            .map_err(StoreError::db("iso_currency_code"))?,
        name: row.try_get("name").map_err(StoreError::db("name"))?,
        merchant_name: row
            .try_get("merchant_name")
            .map_err(StoreError::db("merchant_name"))?,
        raw_category: row
            .try_get("raw_category")
            .map_err(StoreError::db("raw_category"))?,
        category: row.try_get("category").map_err(StoreError::db("category"))?,
        kind,
        date,
        pending: row.try_get("pending").map_err(StoreError::db("pending"))?,
        budget_id: row.try_get("budget_id").map_err(StoreError::db("budget_id"))?,
        created_at: row.try_get("created_at").map_err(StoreError::db("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(StoreError::db("updated_at"))?,
    })
}

fn budget_from_row(row: &PgRow) -> Result<Budget, StoreError> {
    Ok(Budget {
        id: row.try_get("id").map_err(StoreError::db("id"))?,
        user_id: row.try_get("user_id").map_err(StoreError::db("user_id"))?,
        name: row.try_get("name").map_err(StoreError::db("name"))?,
        category: row.try_get("category").map_err(StoreError::db("category"))?,
        amount: row.try_get("amount").map_err(StoreError::db("amount"))?,
        spent: row.try_get("spent").map_err(StoreError::db("spent"))?,
        created_at: row.try_get("created_at").map_err(StoreError::db("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(StoreError::db("updated_at"))?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl LinkStore for PgLinkStore {
    async fn insert_linked_account(&self, account: &LinkedAccount) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO linked_accounts (item_id, user_id, institution_id, institution_name, \
             credential, status, error_code, cursor, last_synced_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&account.item_id)
        .bind(&account.user_id)
        .bind(&account.institution_id)
        .bind(&account.institution_name)
        .bind(account.credential.envelope())
        .bind(account.status.as_str())
        .bind(&account.error_code)
        .bind(&account.cursor)
        .bind(account.last_synced_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(account.item_id.clone())),
            Err(err) => Err(StoreError::db("insert linked account")(err)),
        }
    }

    async fn replace_credential(
        &self,
        item_id: &str,
        credential: &SealedCredential,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE linked_accounts SET credential = $2, status = 'active', error_code = NULL, \
             updated_at = NOW() WHERE item_id = $1",
        )
        .bind(item_id)
        .bind(credential.envelope())
        .execute(&self.pool)
        .await
        .map_err(StoreError::db("replace credential"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(item_id.to_string()));
        }
        Ok(())
    }

    async fn linked_account(&self, item_id: &str) -> Result<Option<LinkedAccount>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LINKED_COLUMNS} FROM linked_accounts WHERE item_id = $1"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::db("get linked account"))?;
        row.as_ref().map(linked_from_row).transpose()
    }

    async fn linked_accounts_for_user(&self, user_id: &str) -> Result<Vec<LinkedAccount>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINKED_COLUMNS} FROM linked_accounts WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::db("list linked accounts"))?;
        rows.iter().map(linked_from_row).collect()
    }

    async fn linked_accounts_with_status(
        &self,
        status: ItemStatus,
    ) -> Result<Vec<LinkedAccount>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINKED_COLUMNS} FROM linked_accounts WHERE status = $1 ORDER BY updated_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::db("list linked accounts by status"))?;
        rows.iter().map(linked_from_row).collect()
    }

    async fn item_for_bank_account(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> Result<Option<LinkedAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT la.item_id, la.user_id, la.institution_id, la.institution_name, la.credential, \
             la.status, la.error_code, la.cursor, la.last_synced_at, la.created_at, la.updated_at \
             FROM linked_accounts la JOIN bank_accounts ba ON ba.item_id = la.item_id \
             WHERE la.user_id = $1 AND ba.account_id = $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::db("resolve bank account"))?;
        row.as_ref().map(linked_from_row).transpose()
    }

    async fn set_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE linked_accounts SET status = $2, error_code = $3, updated_at = NOW() \
             WHERE item_id = $1",
        )
        .bind(item_id)
        .bind(status.as_str())
        .bind(error_code)
        .execute(&self.pool)
        .await
        .map_err(StoreError::db("set status"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        item_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError> {
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
        let result = sqlx::query(
            "UPDATE linked_accounts SET status = $2, error_code = $3, updated_at = NOW() \
             WHERE item_id = $1 AND status = ANY($4)",
        )
        .bind(item_id)
        .bind(to.as_str())
        .bind(error_code)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(StoreError::db("transition status"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_synced(&self, item_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE linked_accounts SET last_synced_at = $2 WHERE item_id = $1")
            .bind(item_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("mark synced"))?;
        Ok(())
    }

    async fn upsert_bank_accounts(&self, accounts: &[BankAccountRecord]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::db("begin bank account upsert"))?;
        for record in accounts {
            sqlx::query(
                "INSERT INTO bank_accounts (item_id, account_id, name, official_name, account_type, \
                 subtype, mask, current_balance, available_balance, iso_currency_code, created_at, \
                 updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (item_id, account_id) DO UPDATE SET name = EXCLUDED.name, \
                 official_name = EXCLUDED.official_name, account_type = EXCLUDED.account_type, \
                 subtype = EXCLUDED.subtype, mask = EXCLUDED.mask, \
                 current_balance = EXCLUDED.current_balance, \
                 available_balance = EXCLUDED.available_balance, \
                 iso_currency_code = EXCLUDED.iso_currency_code, updated_at = EXCLUDED.updated_at",
            )
            .bind(&record.item_id)
            .bind(&record.account_id)
            .bind(&record.name)
            .bind(&record.official_name)
            .bind(&record.account_type)
            .bind(&record.subtype)
            .bind(&record.mask)
            .bind(record.current_balance)
            .bind(record.available_balance)
            .bind(&record.iso_currency_code)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::db("upsert bank account"))?;
        }
        tx.commit()
            .await
            .map_err(StoreError::db("commit bank account upsert"))?;
        Ok(())
    }

    async fn bank_accounts(&self, item_id: &str) -> Result<Vec<BankAccountRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BANK_COLUMNS} FROM bank_accounts WHERE item_id = $1 ORDER BY account_id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::db("list bank accounts"))?;
        rows.iter().map(bank_from_row).collect()
    }

    async fn transactions(&self, item_id: &str) -> Result<Vec<SyncedTransaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TXN_COLUMNS} FROM synced_transactions WHERE item_id = $1 \
             ORDER BY txn_date DESC, provider_transaction_id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::db("list transactions"))?;
        rows.iter().map(txn_from_row).collect()
    }

    async fn budget(&self, budget_id: Uuid) -> Result<Option<Budget>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = $1"))
            .bind(budget_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::db("get budget"))?;
        row.as_ref().map(budget_from_row).transpose()
    }

    async fn delete_linked_account(&self, item_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM linked_accounts WHERE item_id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::db("delete linked account"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin_page(&self, item_id: &str) -> Result<Box<dyn PageTransaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::db("begin page transaction"))?;
        // Row lock serializes page commits for the same item.
        let locked = sqlx::query("SELECT item_id FROM linked_accounts WHERE item_id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::db("lock linked account"))?;
        if locked.is_none() {
            return Err(StoreError::NotFound(item_id.to_string()));
        }
        debug!(item_id, "page transaction opened");
        Ok(Box::new(PgPageTransaction {
            item_id: item_id.to_string(),
            tx: Some(tx),
        }))
    }
}

struct PgPageTransaction {
    item_id: String,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgPageTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl PageTransaction for PgPageTransaction {
    async fn existing_transaction_ids(
        &mut self,
        provider_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if provider_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let tx = self.open()?;
        let rows = sqlx::query(
            "SELECT provider_transaction_id FROM synced_transactions \
             WHERE provider_transaction_id = ANY($1)",
        )
        .bind(provider_ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(StoreError::db("load existing transaction ids"))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("provider_transaction_id")
                    .map_err(StoreError::db("provider_transaction_id"))
            })
            .collect()
    }

    async fn budgets_for_user(&mut self, user_id: &str) -> Result<Vec<Budget>, StoreError> {
        let tx = self.open()?;
        let rows = sqlx::query(&format!(
            "SELECT {BUDGET_COLUMNS} FROM budgets WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(StoreError::db("list budgets"))?;
        rows.iter().map(budget_from_row).collect()
    }

    async fn upsert_transaction(&mut self, txn: &SyncedTransaction) -> Result<(), StoreError> {
        let tx = self.open()?;
        sqlx::query(
            "INSERT INTO synced_transactions (id, item_id, account_id, provider_transaction_id, \
             amount, iso_currency_code, name, merchant_name, raw_category, category, kind, \
             txn_date, pending, budget_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (provider_transaction_id) DO UPDATE SET account_id = EXCLUDED.account_id, \
             amount = EXCLUDED.amount, iso_currency_code = EXCLUDED.iso_currency_code, \
             name = EXCLUDED.name, merchant_name = EXCLUDED.merchant_name, \
             raw_category = EXCLUDED.raw_category, category = EXCLUDED.category, \
             kind = EXCLUDED.kind, txn_date = EXCLUDED.txn_date, pending = EXCLUDED.pending, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(txn.id)
        .bind(&txn.item_id)
        .bind(&txn.account_id)
        .bind(&txn.provider_transaction_id)
        .bind(txn.amount)
        .bind(&txn.iso_currency_code)
        .bind(&txn.name)
        .bind(&txn.merchant_name)
        .bind(&txn.raw_category)
        .bind(&txn.category)
        .bind(txn.kind.as_str())
        .bind(txn.date)
        .bind(txn.pending)
        .bind(txn.budget_id)
        .bind(txn.created_at)
        .bind(txn.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::db("upsert transaction"))?;
        Ok(())
    }

    async fn delete_transaction(&mut self, provider_transaction_id: &str) -> Result<bool, StoreError> {
        let item_id = self.item_id.clone();
        let tx = self.open()?;
        let result = sqlx::query(
            "DELETE FROM synced_transactions WHERE provider_transaction_id = $1 AND item_id = $2",
        )
        .bind(provider_transaction_id)
        .bind(item_id)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::db("delete transaction"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_budget(
        &mut self,
        provider_transaction_id: &str,
        budget_id: Uuid,
    ) -> Result<(), StoreError> {
        let tx = self.open()?;
        sqlx::query("UPDATE synced_transactions SET budget_id = $2 WHERE provider_transaction_id = $1")
            .bind(provider_transaction_id)
            .bind(budget_id)
            .execute(&mut **tx)
            .await
            .map_err(StoreError::db("assign budget"))?;
        Ok(())
    }

    async fn increment_budget_spent(
        &mut self,
        budget_id: Uuid,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Budget>, StoreError> {
        let tx = self.open()?;
        let row = sqlx::query(&format!(
            "UPDATE budgets SET spent = spent + $2, updated_at = $3 WHERE id = $1 \
             RETURNING {BUDGET_COLUMNS}"
        ))
        .bind(budget_id)
        .bind(amount)
        .bind(at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::db("increment budget spent"))?;
        row.as_ref().map(budget_from_row).transpose()
    }

    async fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError> {
        let item_id = self.item_id.clone();
        let tx = self.open()?;
        sqlx::query("UPDATE linked_accounts SET cursor = $2, updated_at = NOW() WHERE item_id = $1")
            .bind(item_id)
            .bind(cursor)
            .execute(&mut **tx)
            .await
            .map_err(StoreError::db("set cursor"))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit()
            .await
            .map_err(StoreError::db("commit page transaction"))?;
        debug!(item_id = %self.item_id, "page transaction committed");
        Ok(())
    }
}
