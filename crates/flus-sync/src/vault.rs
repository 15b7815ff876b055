use std::sync::Arc;

use flus_core::{AccessCredential, ItemStatus, LinkedAccount, SealedCredential};
use flus_provider::{with_retries, AggregationProvider, BackoffPolicy};
use flus_storage::{LinkStore, VaultCipher};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{EngineContext, EngineError};

/// Status code recorded when a stored credential cannot be opened.
pub const CREDENTIAL_UNREADABLE: &str = "CREDENTIAL_UNREADABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalOutcome {
    Deleted,
    PendingRemoval,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalSweep {
    pub attempted: usize,
    pub deleted: usize,
    pub still_pending: usize,
}

/// Custody of access credentials: sealing on link, opening for a single
/// sync, and revoke-before-delete on unlink.
pub struct CredentialVault {
    store: Arc<dyn LinkStore>,
    provider: Arc<dyn AggregationProvider>,
    cipher: Arc<VaultCipher>,
    backoff: BackoffPolicy,
}

impl CredentialVault {
    pub fn new(ctx: &EngineContext) -> Self {
        Self {
            store: ctx.store.clone(),
            provider: ctx.provider.clone(),
            cipher: ctx.cipher.clone(),
            backoff: ctx.backoff,
        }
    }

    pub fn seal(&self, item_id: &str, credential: &AccessCredential) -> Result<SealedCredential, EngineError> {
        self.cipher
            .seal(item_id, credential)
            .map_err(|source| EngineError::Credential {
                item_id: item_id.to_string(),
                source,
            })
    }

    /// Replaces the stored credential of an existing item and re-activates it.
    pub async fn store(&self, item_id: &str, credential: &AccessCredential) -> Result<(), EngineError> {
        let sealed = self.seal(item_id, credential)?;
        self.store.replace_credential(item_id, &sealed).await?;
        info!(item_id, key_id = self.cipher.key_id(), "credential stored");
        Ok(())
    }

    /// Plaintext for the duration of one operation. Never cached.
    pub fn reveal(&self, account: &LinkedAccount) -> Result<AccessCredential, EngineError> {
        self.cipher
            .open(&account.item_id, &account.credential)
            .map_err(|source| EngineError::Credential {
                item_id: account.item_id.clone(),
                source,
            })
    }

    /// Revokes the provider grant, then deletes the item and everything under
    /// it. A failed revoke leaves the data in place with status
    /// `pending_removal` for [`CredentialVault::retry_pending_removals`].
    pub async fn revoke_and_delete(&self, item_id: &str) -> Result<RemovalOutcome, EngineError> {
        let account = self
            .store
            .linked_account(item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(item_id.to_string()))?;

        let credential = match self.reveal(&account) {
            Ok(credential) => credential,
            Err(err) => {
                error!(item_id, error = %err, "cannot open credential to revoke; holding item for removal");
                self.store
                    .set_status(item_id, ItemStatus::PendingRemoval, Some(CREDENTIAL_UNREADABLE))
                    .await?;
                return Err(err);
            }
        };

        let provider = self.provider.as_ref();
        let cred = &credential;
        let revoked = with_retries(&self.backoff, "revoke", || provider.revoke(cred)).await;
        match revoked {
            Ok(()) => {}
            Err(err) if err.is_grant_gone() => {
                warn!(item_id, error = %err, "provider grant already gone; deleting");
            }
            Err(err) => {
                warn!(item_id, error = %err, "revoke failed; item marked pending_removal");
                self.store
                    .set_status(item_id, ItemStatus::PendingRemoval, err.code())
                    .await?;
                return Ok(RemovalOutcome::PendingRemoval);
            }
        }

        if let Err(err) = self.store.delete_linked_account(item_id).await {
            // Grant is revoked but rows remain; the sweep finishes the delete.
            error!(item_id, error = %err, "delete after revoke failed");
            if let Err(hold_err) = self
                .store
                .set_status(item_id, ItemStatus::PendingRemoval, None)
                .await
            {
                error!(item_id, error = %hold_err, "revoked item could not be held for removal");
                return Err(EngineError::RemovalStranded {
                    item_id: item_id.to_string(),
                    source: hold_err,
                });
            }
            return Err(err.into());
        }
        info!(item_id, "linked account revoked and deleted");
        Ok(RemovalOutcome::Deleted)
    }

    pub async fn retry_pending_removals(&self) -> Result<RemovalSweep, EngineError> {
        let pending = self
            .store
            .linked_accounts_with_status(ItemStatus::PendingRemoval)
            .await?;
        let mut sweep = RemovalSweep {
            attempted: pending.len(),
            ..RemovalSweep::default()
        };
        for account in pending {
            match self.revoke_and_delete(&account.item_id).await {
                Ok(RemovalOutcome::Deleted) => sweep.deleted += 1,
                Ok(RemovalOutcome::PendingRemoval) => sweep.still_pending += 1,
                Err(err) => {
                    warn!(item_id = %account.item_id, error = %err, "removal retry failed");
                    sweep.still_pending += 1;
                }
            }
        }
        if sweep.attempted > 0 {
            info!(
                attempted = sweep.attempted,
                deleted = sweep.deleted,
                still_pending = sweep.still_pending,
                "pending removal sweep finished"
            );
        }
        Ok(sweep)
    }
}
