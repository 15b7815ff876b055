use std::sync::Arc;

use flus_core::{ItemStatus, LinkSession, LinkedAccount, LinkedAccountSummary};
use flus_storage::LinkStore;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::engine::{SyncEngine, SyncReport};
use crate::link::LinkSessionManager;
use crate::pool::SyncWorkerPool;
use crate::vault::{CredentialVault, RemovalOutcome, RemovalSweep};
use crate::webhook::{WebhookAck, WebhookDispatcher};
use crate::{EngineContext, EngineError};

/// Client-facing operations over one shared engine context. Every call is
/// scoped to the requesting user's items.
pub struct BankLinkService {
    store: Arc<dyn LinkStore>,
    links: LinkSessionManager,
    vault: Arc<CredentialVault>,
    engine: Arc<SyncEngine>,
    pool: Arc<SyncWorkerPool>,
    webhooks: WebhookDispatcher,
}

impl BankLinkService {
    /// Spawns the worker pool, so this must run inside a tokio runtime.
    pub fn start(ctx: EngineContext, workers: usize, queue_depth: usize) -> Self {
        let engine = Arc::new(SyncEngine::new(ctx.clone()));
        let pool = Arc::new(SyncWorkerPool::start(engine.clone(), workers, queue_depth));
        Self {
            store: ctx.store.clone(),
            links: LinkSessionManager::new(&ctx),
            vault: Arc::new(CredentialVault::new(&ctx)),
            webhooks: WebhookDispatcher::new(ctx.store.clone(), pool.clone()),
            engine,
            pool,
        }
    }

    pub fn store(&self) -> Arc<dyn LinkStore> {
        self.store.clone()
    }

    pub fn vault(&self) -> Arc<CredentialVault> {
        self.vault.clone()
    }

    pub fn pool(&self) -> Arc<SyncWorkerPool> {
        self.pool.clone()
    }

    pub async fn create_link_session(&self, user_id: &str) -> Result<LinkSession, EngineError> {
        self.links.create_link_session(user_id).await
    }

    pub async fn complete_link(
        &self,
        user_id: &str,
        session_result: &str,
        institution_id: &str,
        institution_name: &str,
    ) -> Result<LinkedAccountSummary, EngineError> {
        self.links
            .complete_link(user_id, session_result, institution_id, institution_name)
            .await
    }

    pub async fn list_linked_accounts(&self, user_id: &str) -> Result<Vec<LinkedAccountSummary>, EngineError> {
        let accounts = self.store.linked_accounts_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(accounts.len());
        for account in accounts {
            let records = self.store.bank_accounts(&account.item_id).await?;
            summaries.push(LinkedAccountSummary::new(&account, records));
        }
        Ok(summaries)
    }

    /// Syncs one item (by item id or bank account id), or every active item
    /// the user owns when `account_id` is `None`.
    pub async fn trigger_sync(
        &self,
        user_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<SyncReport>, EngineError> {
        if let Some(account_id) = account_id {
            let account = self.resolve(user_id, account_id).await?;
            if !account.is_syncable() {
                return Err(EngineError::AccountDisabled {
                    item_id: account.item_id,
                    status: account.status,
                });
            }
            return Ok(vec![self.engine.sync(&account.item_id).await?]);
        }

        let mut reports = Vec::new();
        for account in self.store.linked_accounts_for_user(user_id).await? {
            if !account.is_syncable() {
                continue;
            }
            match self.engine.sync(&account.item_id).await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(item_id = %account.item_id, error = %err, "sync for user item failed"),
            }
        }
        Ok(reports)
    }

    pub async fn unlink_account(&self, user_id: &str, account_id: &str) -> Result<RemovalOutcome, EngineError> {
        let account = self.resolve(user_id, account_id).await?;
        if account.status == ItemStatus::PendingRemoval {
            return Err(EngineError::AlreadyRemoving(account.item_id));
        }
        self.vault.revoke_and_delete(&account.item_id).await
    }

    pub async fn handle_webhook(&self, body: JsonValue) -> Result<WebhookAck, EngineError> {
        self.webhooks.handle(body).await
    }

    pub async fn retry_pending_removals(&self) -> Result<RemovalSweep, EngineError> {
        self.vault.retry_pending_removals().await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn resolve(&self, user_id: &str, account_id: &str) -> Result<LinkedAccount, EngineError> {
        if let Some(account) = self.store.linked_account(account_id).await? {
            if account.user_id == user_id {
                return Ok(account);
            }
        }
        self.store
            .item_for_bank_account(user_id, account_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(account_id.to_string()))
    }
}
