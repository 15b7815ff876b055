use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use flus_core::{CategoryMapper, ProviderTransaction, SyncedTransaction, TransactionKind, TransactionPage};
use flus_storage::{PageTransaction, StoreError};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    /// Transactions whose provider id was not stored before this page, in the
    /// state the page left them. Only these are eligible for aggregation.
    pub newly_inserted: Vec<SyncedTransaction>,
}

pub fn synced_from_provider(
    item_id: &str,
    txn: &ProviderTransaction,
    mapper: &CategoryMapper,
    now: DateTime<Utc>,
) -> SyncedTransaction {
    let raw_category = txn.primary_category().to_string();
    SyncedTransaction {
        id: Uuid::new_v4(),
        item_id: item_id.to_string(),
        account_id: txn.account_id.clone(),
        provider_transaction_id: txn.transaction_id.clone(),
        amount: txn.amount,
        iso_currency_code: txn.iso_currency_code.clone(),
        name: txn.name.clone(),
        merchant_name: txn.merchant_name.clone(),
        category: mapper.map(&raw_category),
        raw_category,
        kind: TransactionKind::from_amount(txn.amount),
        date: txn.date,
        pending: txn.pending,
        budget_id: None,
        created_at: now,
        updated_at: now,
    }
}

/// Applies one page inside `tx`: upserts `added` and `modified` alike, then
/// deletes `removed`. Existing ids are snapshotted before any write so a
/// replayed page reports nothing as newly inserted.
pub async fn ingest_page(
    tx: &mut dyn PageTransaction,
    item_id: &str,
    page: &TransactionPage,
    mapper: &CategoryMapper,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, StoreError> {
    let existing = tx.existing_transaction_ids(&page.touched_ids()).await?;

    let mut latest: Vec<SyncedTransaction> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for entry in page.added.iter().chain(page.modified.iter()) {
        let synced = synced_from_provider(item_id, entry, mapper, now);
        tx.upsert_transaction(&synced).await?;
        match position.get(&synced.provider_transaction_id) {
            Some(&idx) => latest[idx] = synced,
            None => {
                position.insert(synced.provider_transaction_id.clone(), latest.len());
                latest.push(synced);
            }
        }
    }

    let mut removed = 0usize;
    let removed_ids: HashSet<&str> = page.removed.iter().map(String::as_str).collect();
    for provider_id in &removed_ids {
        if tx.delete_transaction(provider_id).await? {
            removed += 1;
        }
    }

    let newly_inserted = latest
        .into_iter()
        .filter(|t| !existing.contains(&t.provider_transaction_id))
        .filter(|t| !removed_ids.contains(t.provider_transaction_id.as_str()))
        .collect();

    Ok(IngestOutcome {
        added: page.added.len(),
        modified: page.modified.len(),
        removed,
        newly_inserted,
    })
}
