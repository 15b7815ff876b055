use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flus_core::{BankAccountRecord, Budget, ItemStatus, LinkedAccount, SealedCredential, SyncedTransaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{LinkStore, PageTransaction, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    linked: BTreeMap<String, LinkedAccount>,
    bank_accounts: BTreeMap<(String, String), BankAccountRecord>,
    transactions: HashMap<String, SyncedTransaction>,
    budgets: BTreeMap<Uuid, Budget>,
    cursor_history: HashMap<String, Vec<String>>,
}

/// In-process store used by tests and local runs.
///
/// A page transaction holds the state lock for its whole lifetime and works
/// on a staged copy that only replaces the live state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryLinkStore {
    state: Arc<Mutex<MemoryState>>,
    failing_commits: Arc<AtomicUsize>,
    failing_deletes: Arc<AtomicUsize>,
    failing_status_writes: Arc<AtomicUsize>,
    failing_account_reads: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Budgets belong to the CRUD layer; this stands in for it.
    pub async fn insert_budget(&self, budget: Budget) {
        self.state.lock().await.budgets.insert(budget.id, budget);
    }

    /// Manual-entry write path contending on the same counter as the aggregator.
    pub async fn record_manual_expense(&self, budget_id: Uuid, amount: f64) -> Option<Budget> {
        let mut state = self.state.lock().await;
        let budget = state.budgets.get_mut(&budget_id)?;
        budget.spent += amount;
        budget.updated_at = Utc::now();
        Some(budget.clone())
    }

    /// The next `count` page commits fail and roll back.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// The next `count` linked-account deletes fail without touching state.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// The next `count` status writes fail without touching state.
    pub fn fail_next_status_writes(&self, count: usize) {
        self.failing_status_writes.store(count, Ordering::SeqCst);
    }

    /// The next `count` bank account listings fail.
    pub fn fail_next_account_reads(&self, count: usize) {
        self.failing_account_reads.store(count, Ordering::SeqCst);
    }

    pub fn committed_pages(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Every cursor value committed for `item_id`, oldest first.
    pub async fn cursor_history(&self, item_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .cursor_history
            .get(item_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn insert_linked_account(&self, account: &LinkedAccount) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.linked.contains_key(&account.item_id) {
            return Err(StoreError::Conflict(account.item_id.clone()));
        }
        state.linked.insert(account.item_id.clone(), account.clone());
        Ok(())
    }

    async fn replace_credential(
        &self,
        item_id: &str,
        credential: &SealedCredential,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .linked
            .get_mut(item_id)
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        account.credential = credential.clone();
        account.status = ItemStatus::Active;
        account.error_code = None;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn linked_account(&self, item_id: &str) -> Result<Option<LinkedAccount>, StoreError> {
        Ok(self.state.lock().await.linked.get(item_id).cloned())
    }

    async fn linked_accounts_for_user(&self, user_id: &str) -> Result<Vec<LinkedAccount>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .linked
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn linked_accounts_with_status(
        &self,
        status: ItemStatus,
    ) -> Result<Vec<LinkedAccount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .linked
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn item_for_bank_account(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> Result<Option<LinkedAccount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .bank_accounts
            .values()
            .filter(|b| b.account_id == account_id)
            .filter_map(|b| state.linked.get(&b.item_id))
            .find(|a| a.user_id == user_id)
            .cloned())
    }

    async fn set_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError> {
        if take_failure(&self.failing_status_writes) {
            return Err(StoreError::Unavailable("injected status write failure".to_string()));
        }
        let mut state = self.state.lock().await;
        let Some(account) = state.linked.get_mut(item_id) else {
            return Ok(false);
        };
        account.status = status;
        account.error_code = error_code.map(str::to_string);
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_status(
        &self,
        item_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
        error_code: Option<&str>,
    ) -> Result<bool, StoreError> {
        if take_failure(&self.failing_status_writes) {
            return Err(StoreError::Unavailable("injected status write failure".to_string()));
        }
        let mut state = self.state.lock().await;
        let Some(account) = state.linked.get_mut(item_id) else {
            return Ok(false);
        };
        if !from.contains(&account.status) {
            return Ok(false);
        }
        account.status = to;
        account.error_code = error_code.map(str::to_string);
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_synced(&self, item_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(account) = self.state.lock().await.linked.get_mut(item_id) {
            account.last_synced_at = Some(at);
        }
        Ok(())
    }

    async fn upsert_bank_accounts(&self, accounts: &[BankAccountRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for record in accounts {
            if !state.linked.contains_key(&record.item_id) {
                return Err(StoreError::NotFound(record.item_id.clone()));
            }
            let key = (record.item_id.clone(), record.account_id.clone());
            let created_at = state
                .bank_accounts
                .get(&key)
                .map(|existing| existing.created_at)
                .unwrap_or(record.created_at);
            state.bank_accounts.insert(
                key,
                BankAccountRecord {
                    created_at,
                    ..record.clone()
                },
            );
        }
        Ok(())
    }

    async fn bank_accounts(&self, item_id: &str) -> Result<Vec<BankAccountRecord>, StoreError> {
        if take_failure(&self.failing_account_reads) {
            return Err(StoreError::Unavailable("injected account read failure".to_string()));
        }
        let state = self.state.lock().await;
        Ok(state
            .bank_accounts
            .values()
            .filter(|b| b.item_id == item_id)
            .cloned()
            .collect())
    }

    async fn transactions(&self, item_id: &str) -> Result<Vec<SyncedTransaction>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .transactions
            .values()
            .filter(|t| t.item_id == item_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| a.provider_transaction_id.cmp(&b.provider_transaction_id))
        });
        Ok(rows)
    }

    async fn budget(&self, budget_id: Uuid) -> Result<Option<Budget>, StoreError> {
        Ok(self.state.lock().await.budgets.get(&budget_id).cloned())
    }

    async fn delete_linked_account(&self, item_id: &str) -> Result<bool, StoreError> {
        if take_failure(&self.failing_deletes) {
            return Err(StoreError::Unavailable("injected delete failure".to_string()));
        }
        let mut state = self.state.lock().await;
        if state.linked.remove(item_id).is_none() {
            return Ok(false);
        }
        state.bank_accounts.retain(|(owner, _), _| owner != item_id);
        state.transactions.retain(|_, t| t.item_id != item_id);
        state.cursor_history.remove(item_id);
        Ok(true)
    }

    async fn begin_page(&self, item_id: &str) -> Result<Box<dyn PageTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        if !guard.linked.contains_key(item_id) {
            return Err(StoreError::NotFound(item_id.to_string()));
        }
        let staged = guard.clone();
        Ok(Box::new(MemoryPageTransaction {
            item_id: item_id.to_string(),
            guard: Some(guard),
            staged,
            failing_commits: self.failing_commits.clone(),
            commits: self.commits.clone(),
        }))
    }
}

struct MemoryPageTransaction {
    item_id: String,
    guard: Option<OwnedMutexGuard<MemoryState>>,
    staged: MemoryState,
    failing_commits: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

impl MemoryPageTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl PageTransaction for MemoryPageTransaction {
    async fn existing_transaction_ids(
        &mut self,
        provider_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        self.ensure_open()?;
        Ok(provider_ids
            .iter()
            .filter(|id| self.staged.transactions.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn budgets_for_user(&mut self, user_id: &str) -> Result<Vec<Budget>, StoreError> {
        self.ensure_open()?;
        let mut budgets: Vec<_> = self
            .staged
            .budgets
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        budgets.sort_by_key(|b| b.created_at);
        Ok(budgets)
    }

    async fn upsert_transaction(&mut self, txn: &SyncedTransaction) -> Result<(), StoreError> {
        self.ensure_open()?;
        let row = match self.staged.transactions.get(&txn.provider_transaction_id) {
            Some(existing) => SyncedTransaction {
                id: existing.id,
                budget_id: existing.budget_id,
                created_at: existing.created_at,
                ..txn.clone()
            },
            None => txn.clone(),
        };
        self.staged
            .transactions
            .insert(txn.provider_transaction_id.clone(), row);
        Ok(())
    }

    async fn delete_transaction(&mut self, provider_transaction_id: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let owned_here = self
            .staged
            .transactions
            .get(provider_transaction_id)
            .is_some_and(|t| t.item_id == self.item_id);
        if owned_here {
            self.staged.transactions.remove(provider_transaction_id);
        }
        Ok(owned_here)
    }

    async fn assign_budget(
        &mut self,
        provider_transaction_id: &str,
        budget_id: Uuid,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(txn) = self.staged.transactions.get_mut(provider_transaction_id) {
            txn.budget_id = Some(budget_id);
        }
        Ok(())
    }

    async fn increment_budget_spent(
        &mut self,
        budget_id: Uuid,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Budget>, StoreError> {
        self.ensure_open()?;
        let Some(budget) = self.staged.budgets.get_mut(&budget_id) else {
            return Ok(None);
        };
        budget.spent += amount;
        budget.updated_at = at;
        Ok(Some(budget.clone()))
    }

    async fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let account = self
            .staged
            .linked
            .get_mut(&self.item_id)
            .ok_or_else(|| StoreError::NotFound(self.item_id.clone()))?;
        account.cursor = Some(cursor.to_string());
        account.updated_at = Utc::now();
        self.staged
            .cursor_history
            .entry(self.item_id.clone())
            .or_default()
            .push(cursor.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionClosed)?;
        if take_failure(&self.failing_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        *guard = std::mem::take(&mut self.staged);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flus_core::TransactionKind;

    fn linked(item_id: &str) -> LinkedAccount {
        let now = Utc::now();
        LinkedAccount {
            item_id: item_id.to_string(),
            user_id: "user-1".into(),
            institution_id: "ins_1".into(),
            institution_name: "Chase".into(),
            credential: SealedCredential::from_envelope("v1:k:n:c"),
            status: ItemStatus::Active,
            error_code: None,
            cursor: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn txn(item_id: &str, provider_id: &str, amount: f64) -> SyncedTransaction {
        let now = Utc::now();
        SyncedTransaction {
            id: Uuid::new_v4(),
            item_id: item_id.to_string(),
            account_id: "acc-1".into(),
            provider_transaction_id: provider_id.to_string(),
            amount,
            iso_currency_code: Some("USD".into()),
            name: "Coffee".into(),
            merchant_name: None,
            raw_category: "Food and Drink".into(),
            category: "Food & Dining".into(),
            kind: TransactionKind::from_amount(amount),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            pending: false,
            budget_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn dropped_page_transaction_rolls_back() {
        let store = MemoryLinkStore::new();
        store.insert_linked_account(&linked("item_1")).await.unwrap();
        {
            let mut tx = store.begin_page("item_1").await.unwrap();
            tx.upsert_transaction(&txn("item_1", "t1", 5.0)).await.unwrap();
            tx.set_cursor("c1").await.unwrap();
        }
        assert_eq!(store.transaction_count().await, 0);
        let account = store.linked_account("item_1").await.unwrap().unwrap();
        assert_eq!(account.cursor, None);
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_staged_writes() {
        let store = MemoryLinkStore::new();
        store.insert_linked_account(&linked("item_1")).await.unwrap();
        store.fail_next_commits(1);

        let mut tx = store.begin_page("item_1").await.unwrap();
        tx.upsert_transaction(&txn("item_1", "t1", 5.0)).await.unwrap();
        tx.set_cursor("c1").await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        drop(tx);

        assert_eq!(store.transaction_count().await, 0);
        assert!(store.cursor_history("item_1").await.is_empty());

        let mut tx = store.begin_page("item_1").await.unwrap();
        tx.upsert_transaction(&txn("item_1", "t1", 5.0)).await.unwrap();
        tx.set_cursor("c1").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(store.committed_pages(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_surrogate_id_and_budget_link() {
        let store = MemoryLinkStore::new();
        store.insert_linked_account(&linked("item_1")).await.unwrap();
        let budget_id = Uuid::new_v4();

        let first = txn("item_1", "t1", 5.0);
        let mut tx = store.begin_page("item_1").await.unwrap();
        tx.upsert_transaction(&first).await.unwrap();
        tx.assign_budget("t1", budget_id).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_page("item_1").await.unwrap();
        tx.upsert_transaction(&txn("item_1", "t1", 7.25)).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.transactions("item_1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[0].amount, 7.25);
        assert_eq!(rows[0].budget_id, Some(budget_id));
    }

    #[tokio::test]
    async fn delete_cascades_to_accounts_and_transactions() {
        let store = MemoryLinkStore::new();
        store.insert_linked_account(&linked("item_1")).await.unwrap();
        store.insert_linked_account(&linked("item_2")).await.unwrap();
        let now = Utc::now();
        let record = BankAccountRecord {
            item_id: "item_1".into(),
            account_id: "acc-1".into(),
            name: "Checking".into(),
            official_name: None,
            account_type: "depository".into(),
            subtype: Some("checking".into()),
            mask: Some("0000".into()),
            current_balance: Some(100.0),
            available_balance: None,
            iso_currency_code: Some("USD".into()),
            created_at: now,
            updated_at: now,
        };
        store.upsert_bank_accounts(&[record]).await.unwrap();
        let mut tx = store.begin_page("item_1").await.unwrap();
        tx.upsert_transaction(&txn("item_1", "t1", 5.0)).await.unwrap();
        tx.commit().await.unwrap();
        let mut tx = store.begin_page("item_2").await.unwrap();
        tx.upsert_transaction(&txn("item_2", "t2", 5.0)).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.delete_linked_account("item_1").await.unwrap());
        assert!(store.bank_accounts("item_1").await.unwrap().is_empty());
        assert!(store.transactions("item_1").await.unwrap().is_empty());
        assert_eq!(store.transactions("item_2").await.unwrap().len(), 1);
        assert!(!store.delete_linked_account("item_1").await.unwrap());
    }

    #[tokio::test]
    async fn begin_page_for_unknown_item_fails() {
        let store = MemoryLinkStore::new();
        assert!(matches!(
            store.begin_page("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn transition_leaves_other_statuses_alone() {
        let store = MemoryLinkStore::new();
        store.insert_linked_account(&linked("item_1")).await.unwrap();
        store
            .set_status("item_1", ItemStatus::PendingRemoval, Some("INSTITUTION_DOWN"))
            .await
            .unwrap();

        let moved = store
            .transition_status("item_1", &[ItemStatus::Active], ItemStatus::Error, Some("ITEM_LOGIN_REQUIRED"))
            .await
            .unwrap();
        assert!(!moved);
        let account = store.linked_account("item_1").await.unwrap().unwrap();
        assert_eq!(account.status, ItemStatus::PendingRemoval);
        assert_eq!(account.error_code.as_deref(), Some("INSTITUTION_DOWN"));

        assert!(store
            .transition_status("item_1", &[ItemStatus::PendingRemoval], ItemStatus::Active, None)
            .await
            .unwrap());
        assert!(!store
            .transition_status("missing", &[ItemStatus::Active], ItemStatus::Error, None)
            .await
            .unwrap());
    }
}
