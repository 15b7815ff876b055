use chrono::{DateTime, Utc};
use flus_core::{Budget, SyncedTransaction, TransactionKind};
use flus_storage::{PageTransaction, StoreError};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetUpdate {
    pub budget_id: Uuid,
    pub budget_name: String,
    pub provider_transaction_id: String,
    pub amount: f64,
    pub spent: f64,
    pub progress: f64,
    /// This increment moved the budget across the alert threshold.
    pub alert: bool,
}

/// Settled expenses with a category roll into budgets; pending entries and
/// income never do.
pub fn is_aggregatable(txn: &SyncedTransaction) -> bool {
    txn.kind == TransactionKind::Expense && !txn.pending && !txn.category.trim().is_empty()
}

/// Exact case-insensitive category match first, then a budget whose name
/// contains the category. Earliest-created wins within either tier.
pub fn select_budget<'a>(budgets: &'a [Budget], category: &str) -> Option<&'a Budget> {
    let wanted = category.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    let earliest = |candidates: Vec<&'a Budget>| {
        candidates
            .into_iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    };
    let by_category: Vec<&Budget> = budgets
        .iter()
        .filter(|b| b.category.trim().to_lowercase() == wanted)
        .collect();
    if !by_category.is_empty() {
        return earliest(by_category);
    }
    earliest(
        budgets
            .iter()
            .filter(|b| b.name.to_lowercase().contains(&wanted))
            .collect(),
    )
}

/// Rolls newly inserted transactions into the user's budgets inside the page
/// transaction. `spent` is incremented in the store, never read-modify-written here.
pub async fn aggregate_new(
    tx: &mut dyn PageTransaction,
    user_id: &str,
    newly_inserted: &[SyncedTransaction],
    alert_threshold: f64,
    now: DateTime<Utc>,
) -> Result<Vec<BudgetUpdate>, StoreError> {
    let eligible: Vec<&SyncedTransaction> = newly_inserted.iter().filter(|t| is_aggregatable(t)).collect();
    if eligible.is_empty() {
        return Ok(Vec::new());
    }
    let budgets = tx.budgets_for_user(user_id).await?;

    let mut updates = Vec::new();
    for txn in eligible {
        let Some(budget) = select_budget(&budgets, &txn.category) else {
            continue;
        };
        let amount = txn.absolute_amount();
        tx.assign_budget(&txn.provider_transaction_id, budget.id).await?;
        let Some(updated) = tx.increment_budget_spent(budget.id, amount, now).await? else {
            continue;
        };
        let before = if updated.amount > 0.0 {
            (updated.spent - amount) / updated.amount
        } else {
            0.0
        };
        let progress = updated.progress();
        updates.push(BudgetUpdate {
            budget_id: updated.id,
            budget_name: updated.name.clone(),
            provider_transaction_id: txn.provider_transaction_id.clone(),
            amount,
            spent: updated.spent,
            progress,
            alert: before < alert_threshold && progress >= alert_threshold,
        });
    }
    Ok(updates)
}
