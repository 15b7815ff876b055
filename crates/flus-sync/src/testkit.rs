use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use flus_core::{
    AccessCredential, Budget, ItemStatus, LinkedAccount, ProviderAccount, ProviderTransaction,
    TransactionPage,
};
use flus_provider::{BackoffPolicy, ScriptedProvider};
use flus_storage::{MemoryLinkStore, VaultCipher};
use uuid::Uuid;

use crate::EngineContext;

pub(crate) struct Harness {
    pub store: MemoryLinkStore,
    pub provider: Arc<ScriptedProvider>,
    pub ctx: EngineContext,
}

pub(crate) fn harness() -> Harness {
    let store = MemoryLinkStore::new();
    let provider = Arc::new(ScriptedProvider::new());
    let cipher = VaultCipher::new([42u8; 32], Some("test".into())).unwrap();
    let ctx = EngineContext::new(Arc::new(store.clone()), provider.clone(), cipher).with_backoff(
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );
    Harness { store, provider, ctx }
}

impl Harness {
    pub async fn seed_linked(&self, item_id: &str, user_id: &str, access_token: &str) -> LinkedAccount {
        let now = Utc::now();
        let account = LinkedAccount {
            item_id: item_id.to_string(),
            user_id: user_id.to_string(),
            institution_id: "ins_1".into(),
            institution_name: "Chase".into(),
            credential: self
                .ctx
                .cipher
                .seal(item_id, &AccessCredential::new(access_token))
                .unwrap(),
            status: ItemStatus::Active,
            error_code: None,
            cursor: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        flus_storage::LinkStore::insert_linked_account(&self.store, &account)
            .await
            .unwrap();
        account
    }

    pub async fn seed_budget(&self, user_id: &str, name: &str, category: &str, amount: f64, age_secs: i64) -> Budget {
        let created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        let budget = Budget {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            amount,
            spent: 0.0,
            created_at,
            updated_at: created_at,
        };
        self.store.insert_budget(budget.clone()).await;
        budget
    }
}

pub(crate) fn provider_account(account_id: &str) -> ProviderAccount {
    ProviderAccount {
        account_id: account_id.to_string(),
        name: "Chase Checking".into(),
        official_name: None,
        account_type: "depository".into(),
        subtype: Some("checking".into()),
        mask: Some("0000".into()),
        current_balance: Some(100.0),
        available_balance: Some(90.0),
        iso_currency_code: Some("USD".into()),
    }
}

pub(crate) fn provider_txn(id: &str, amount: f64, category: &str) -> ProviderTransaction {
    ProviderTransaction {
        transaction_id: id.to_string(),
        account_id: "acc_checking".into(),
        amount,
        iso_currency_code: Some("USD".into()),
        name: format!("Merchant {id}"),
        merchant_name: None,
        category: if category.is_empty() {
            Vec::new()
        } else {
            vec![category.to_string()]
        },
        date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        pending: false,
    }
}

pub(crate) fn page(
    added: Vec<ProviderTransaction>,
    modified: Vec<ProviderTransaction>,
    removed: &[&str],
    next_cursor: &str,
    has_more: bool,
) -> TransactionPage {
    TransactionPage {
        added,
        modified,
        removed: removed.iter().map(|s| s.to_string()).collect(),
        next_cursor: next_cursor.to_string(),
        has_more,
    }
}
