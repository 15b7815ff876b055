use std::sync::Arc;

use chrono::Utc;
use flus_core::{BankAccountRecord, ItemStatus, LinkSession, LinkedAccount, LinkedAccountSummary};
use flus_provider::{with_retries, AggregationProvider, BackoffPolicy};
use flus_storage::LinkStore;
use tracing::{info, warn};

use crate::vault::CredentialVault;
use crate::{EngineContext, EngineError};

/// Link-session handshake: hands the client a session token, then exchanges
/// the session result for a durable credential and records the item.
pub struct LinkSessionManager {
    store: Arc<dyn LinkStore>,
    provider: Arc<dyn AggregationProvider>,
    vault: CredentialVault,
    backoff: BackoffPolicy,
}

impl LinkSessionManager {
    pub fn new(ctx: &EngineContext) -> Self {
        Self {
            store: ctx.store.clone(),
            provider: ctx.provider.clone(),
            vault: CredentialVault::new(ctx),
            backoff: ctx.backoff,
        }
    }

    pub async fn create_link_session(&self, user_id: &str) -> Result<LinkSession, EngineError> {
        let provider = self.provider.as_ref();
        let session = with_retries(&self.backoff, "create_link_session", || {
            provider.create_link_session(user_id)
        })
        .await
        .map_err(EngineError::from_provider)?;
        info!(user_id, provider = provider.provider_id(), "link session created");
        Ok(session)
    }

    /// Nothing is persisted unless the exchange succeeds. Re-linking an item
    /// the user already owns replaces its credential and re-activates it.
    pub async fn complete_link(
        &self,
        user_id: &str,
        session_result: &str,
        institution_id: &str,
        institution_name: &str,
    ) -> Result<LinkedAccountSummary, EngineError> {
        let provider = self.provider.as_ref();
        let exchanged = with_retries(&self.backoff, "exchange", || provider.exchange(session_result))
            .await
            .map_err(EngineError::from_provider)?;
        let item_id = exchanged.item_id.clone();

        match self.store.linked_account(&item_id).await? {
            Some(existing) if existing.user_id != user_id => {
                warn!(item_id = %item_id, "exchanged item belongs to another user");
                return Err(EngineError::Link(format!(
                    "item {item_id} is linked to a different user"
                )));
            }
            Some(_) => {
                self.vault.store(&item_id, &exchanged.credential).await?;
                info!(item_id = %item_id, user_id, "item re-linked");
            }
            None => {
                let now = Utc::now();
                let account = LinkedAccount {
                    item_id: item_id.clone(),
                    user_id: user_id.to_string(),
                    institution_id: institution_id.to_string(),
                    institution_name: institution_name.to_string(),
                    credential: self.vault.seal(&item_id, &exchanged.credential)?,
                    status: ItemStatus::Active,
                    error_code: None,
                    cursor: None,
                    last_synced_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_linked_account(&account).await?;
                info!(item_id = %item_id, user_id, institution_id, "item linked");
            }
        }

        let credential = &exchanged.credential;
        let records = match with_retries(&self.backoff, "list_accounts", || provider.list_accounts(credential)).await {
            Ok(accounts) => {
                let now = Utc::now();
                let records: Vec<BankAccountRecord> = accounts
                    .iter()
                    .map(|a| BankAccountRecord::from_provider(&item_id, a, now))
                    .collect();
                match self.store.upsert_bank_accounts(&records).await {
                    Ok(()) => Some(records),
                    Err(err) => {
                        warn!(item_id = %item_id, error = %err, "storing bank accounts failed");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(item_id = %item_id, error = %err, "account listing failed; the next sync retries it");
                None
            }
        };

        let account = self
            .store
            .linked_account(&item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(item_id.clone()))?;
        let accounts = match records {
            Some(records) => records,
            None => self.store.bank_accounts(&item_id).await?,
        };
        Ok(LinkedAccountSummary::new(&account, accounts))
    }
}

#[cfg(test)]
mod tests {
    use flus_provider::{ProviderError, ProviderOp};

    use super::*;
    use crate::testkit::{harness, provider_account};

    #[tokio::test]
    async fn session_token_is_issued_per_user() {
        let h = harness();
        let manager = LinkSessionManager::new(&h.ctx);
        let session = manager.create_link_session("user-1").await.unwrap();
        assert!(session.link_token.contains("user-1"));
    }

    #[tokio::test]
    async fn exchange_persists_sealed_credential_and_accounts() {
        let h = harness();
        h.provider.add_exchange("public-1", "item_1", "access-1");
        h.provider.set_accounts("access-1", vec![provider_account("acc_checking")]);
        let manager = LinkSessionManager::new(&h.ctx);

        let summary = manager
            .complete_link("user-1", "public-1", "ins_3", "Chase")
            .await
            .unwrap();
        assert_eq!(summary.item_id, "item_1");
        assert_eq!(summary.status, ItemStatus::Active);
        assert_eq!(summary.accounts.len(), 1);

        let stored = h.store.linked_account("item_1").await.unwrap().unwrap();
        assert_eq!(stored.user_id, "user-1");
        assert_eq!(stored.cursor, None);
        assert!(!stored.credential.envelope().contains("access-1"));
        assert_eq!(CredentialVault::new(&h.ctx).reveal(&stored).unwrap().expose(), "access-1");
    }

    #[tokio::test]
    async fn failed_exchange_creates_nothing() {
        let h = harness();
        let manager = LinkSessionManager::new(&h.ctx);
        assert!(matches!(
            manager.complete_link("user-1", "bogus", "ins_3", "Chase").await,
            Err(EngineError::Link(_))
        ));
        assert!(h.store.linked_accounts_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exchange_outage_surfaces_as_transient() {
        let h = harness();
        h.provider.add_exchange("public-1", "item_1", "access-1");
        for _ in 0..3 {
            h.provider
                .push_failure(ProviderOp::Exchange, ProviderError::transient("INTERNAL_SERVER_ERROR"));
        }
        let manager = LinkSessionManager::new(&h.ctx);
        assert!(matches!(
            manager.complete_link("user-1", "public-1", "ins_3", "Chase").await,
            Err(EngineError::ProviderTransient(_))
        ));
        assert!(h.store.linked_account("item_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn account_listing_failure_still_links() {
        let h = harness();
        h.provider.add_exchange("public-1", "item_1", "access-1");
        h.provider
            .push_failure(ProviderOp::ListAccounts, ProviderError::permanent("PRODUCTS_NOT_READY"));
        let summary = LinkSessionManager::new(&h.ctx)
            .complete_link("user-1", "public-1", "ins_3", "Chase")
            .await
            .unwrap();
        assert!(summary.accounts.is_empty());
        assert!(h.store.linked_account("item_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_account_read_failure_is_reported() {
        let h = harness();
        h.provider.add_exchange("public-1", "item_1", "access-1");
        h.provider
            .push_failure(ProviderOp::ListAccounts, ProviderError::permanent("PRODUCTS_NOT_READY"));
        h.store.fail_next_account_reads(1);
        assert!(matches!(
            LinkSessionManager::new(&h.ctx)
                .complete_link("user-1", "public-1", "ins_3", "Chase")
                .await,
            Err(EngineError::Persistence(_))
        ));
        assert!(h.store.linked_account("item_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn relink_reactivates_errored_item() {
        let h = harness();
        h.seed_linked("item_1", "user-1", "access-old").await;
        h.store
            .set_status("item_1", ItemStatus::Error, Some("ITEM_LOGIN_REQUIRED"))
            .await
            .unwrap();
        h.provider.add_exchange("public-2", "item_1", "access-new");

        let summary = LinkSessionManager::new(&h.ctx)
            .complete_link("user-1", "public-2", "ins_1", "Chase")
            .await
            .unwrap();
        assert_eq!(summary.status, ItemStatus::Active);
        assert_eq!(summary.error_code, None);
        let stored = h.store.linked_account("item_1").await.unwrap().unwrap();
        assert_eq!(CredentialVault::new(&h.ctx).reveal(&stored).unwrap().expose(), "access-new");
    }

    #[tokio::test]
    async fn item_owned_by_another_user_is_rejected() {
        let h = harness();
        h.seed_linked("item_1", "user-1", "access-1").await;
        h.provider.add_exchange("public-2", "item_1", "access-2");
        assert!(matches!(
            LinkSessionManager::new(&h.ctx)
                .complete_link("user-2", "public-2", "ins_1", "Chase")
                .await,
            Err(EngineError::Link(_))
        ));
    }
}
